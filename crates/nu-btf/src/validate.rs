//! Graph validation
//!
//! Two checks run before a graph may be encoded:
//! - every referenced type id exists
//! - no chain of resolution edges (pointer, typedef, qualifier, type tag)
//!   leads back onto itself
//!
//! Resolution edges form a functional graph (at most one outgoing edge per
//! record), so the cycle search walks each chain once with an explicit path
//! instead of recursing. Records proven acyclic are never walked again, which
//! keeps the search linear in the number of records.

use log::warn;

use crate::btf::Btf;
use crate::error::{FormatError, Result};
use crate::types::TypeId;

/// A cycle of resolution edges
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle {
    /// The record at which the walk re-entered its own path
    pub entry: TypeId,
    /// Records on the cycle, starting with `entry`
    pub members: Vec<TypeId>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnPath,
    Done,
}

pub struct Validator;

impl Validator {
    /// Run every check, reporting the first failure
    pub fn validate(btf: &Btf) -> Result<()> {
        Self::check_references(btf)?;
        Self::check_cycles(btf)
    }

    /// Fail on the first record that refers to a type id past the end of the graph
    pub fn check_references(btf: &Btf) -> Result<()> {
        for (id, ty) in btf.types() {
            if let Some(target) = ty.references().into_iter().find(|t| !btf.contains(*t)) {
                return Err(FormatError::DanglingReference {
                    type_id: id,
                    target,
                });
            }
        }
        Ok(())
    }

    /// Fail if any resolution chain is cyclic
    pub fn check_cycles(btf: &Btf) -> Result<()> {
        let cycles = Self::find_cycles(btf);
        match cycles.first() {
            Some(first) => Err(FormatError::CyclicType {
                type_id: first.entry,
                cycles: cycles.len(),
            }),
            None => Ok(()),
        }
    }

    /// Every distinct resolution cycle in the graph, each reported once
    pub fn find_cycles(btf: &Btf) -> Vec<Cycle> {
        let count = btf.len();
        // index 0 is void and never walked
        let mut marks = vec![Mark::Unvisited; count + 1];
        let mut cycles = Vec::new();
        let mut path = Vec::new();

        for start in 1..=count {
            if marks[start] != Mark::Unvisited {
                continue;
            }

            let mut current = start;
            loop {
                match marks[current] {
                    Mark::Done => break,
                    Mark::OnPath => {
                        let position = path
                            .iter()
                            .position(|id| *id == current)
                            .unwrap_or_default();
                        let members: Vec<TypeId> =
                            path[position..].iter().map(|id| TypeId(*id as u32)).collect();
                        warn!(
                            "BTF type {} is part of a {}-record reference cycle",
                            TypeId(current as u32),
                            members.len()
                        );
                        cycles.push(Cycle {
                            entry: TypeId(current as u32),
                            members,
                        });
                        break;
                    }
                    Mark::Unvisited => {
                        marks[current] = Mark::OnPath;
                        path.push(current);
                        let next = btf
                            .type_by_id(TypeId(current as u32))
                            .ok()
                            .and_then(|ty| ty.resolution_target())
                            .map(|t| t.0 as usize);
                        match next {
                            // void and dangling targets end the chain
                            Some(next) if next != 0 && next <= count => current = next,
                            _ => break,
                        }
                    }
                }
            }

            for id in path.drain(..) {
                marks[id] = Mark::Done;
            }
        }

        cycles
    }
}
