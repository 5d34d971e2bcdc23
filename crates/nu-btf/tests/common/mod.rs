use nu_btf::{Btf, BtfType, Composite, FuncLinkage, IntEncoding, Member, TypeId, VarLinkage};

/// One record of every kind
pub fn all_kinds() -> Btf {
    let mut btf = Btf::new();
    let int = btf.add_int("int", 4, IntEncoding::SIGNED);
    let char_ty = btf.add_int("char", 1, IntEncoding::SIGNED | IntEncoding::CHAR);
    let ptr = btf.add_ptr(char_ty);
    let array = btf.add_array(int, int, 16);

    let flags = btf.add_string("flags");
    let mode = btf.add_string("mode");
    let name = btf.add_string("packet");
    let packet = btf.append(BtfType::Struct(Composite {
        name_offset: name,
        size: 4,
        kind_flag: true,
        members: vec![
            Member {
                name_offset: flags,
                type_id: int,
                offset: 3 << 24,
            },
            Member {
                name_offset: mode,
                type_id: int,
                offset: (5 << 24) | 3,
            },
        ],
    }));
    btf.add_union("value", 8, &[("i", int, 0), ("p", ptr, 0)]);
    btf.add_enum("state", 4, false, &[("IDLE", 0), ("BUSY", 0xffff_fffe)]);
    btf.add_fwd("sock", false);
    let packet_t = btf.add_typedef("packet_t", packet);
    let volatile = btf.add_volatile(packet_t);
    let konst = btf.add_const(volatile);
    btf.add_restrict(ptr);
    let proto = btf.add_func_proto(int, &[("ctx", ptr), ("", TypeId::VOID)]);
    let func = btf.add_func("handle", proto, FuncLinkage::Global);
    let var = btf.add_var("packets", array, VarLinkage::GlobalAllocated);
    btf.add_datasec(".bss", &[(var, 0, 64)]);
    btf.add_float("double", 8);
    btf.add_decl_tag("kfunc", func, -1);
    btf.add_type_tag("user", konst);
    btf.add_enum64("big", 8, true, &[("MIN", i64::MIN), ("ONE", 1)]);
    btf
}
