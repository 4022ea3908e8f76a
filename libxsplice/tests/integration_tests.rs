//! End-to-end tests: build synthetic relocatable objects, run the whole
//! differencing pipeline and inspect the emitted patch object.

use object::elf;
use object::read::Object as _;
use object::read::ObjectSection as _;
use object::read::ObjectSymbol as _;
use object::write;
use object::Architecture;
use object::BinaryFormat;
use object::Endianness;
use object::RelocationFlags;
use object::RelocationTarget;
use object::SectionKind;
use object::SymbolFlags;
use object::SymbolKind;
use object::SymbolScope;

use libxsplice::create_diff;
use libxsplice::error::NoChanges;
use libxsplice::error::UnsupportedDiff;

struct Builder {
    obj: write::Object<'static>,
}

impl Builder {
    fn new() -> Builder {
        let mut obj = write::Object::new(
            BinaryFormat::Elf,
            Architecture::X86_64,
            Endianness::Little,
        );
        obj.add_file_symbol(b"test.c".to_vec());
        Builder { obj }
    }

    fn func(
        &mut self,
        name: &str,
        body: &[u8],
        scope: SymbolScope,
    ) -> (write::SectionId, write::SymbolId) {
        let section = self.obj.add_section(
            Vec::new(),
            format!(".text.{name}").into_bytes(),
            SectionKind::Text,
        );
        self.obj.append_section_data(section, body, 16);
        let symbol = self.obj.add_symbol(write::Symbol {
            name: name.as_bytes().to_vec(),
            value: 0,
            size: body.len() as u64,
            kind: SymbolKind::Text,
            scope,
            weak: false,
            section: write::SymbolSection::Section(section),
            flags: SymbolFlags::None,
        });
        (section, symbol)
    }

    fn data_object(
        &mut self,
        section_name: &str,
        symbol_name: &str,
        data: &[u8],
        kind: SectionKind,
    ) -> (write::SectionId, write::SymbolId) {
        let section = self.obj.add_section(
            Vec::new(),
            section_name.as_bytes().to_vec(),
            kind,
        );
        self.obj.append_section_data(section, data, 8);
        let symbol = self.obj.add_symbol(write::Symbol {
            name: symbol_name.as_bytes().to_vec(),
            value: 0,
            size: data.len() as u64,
            kind: SymbolKind::Data,
            scope: SymbolScope::Compilation,
            weak: false,
            section: write::SymbolSection::Section(section),
            flags: SymbolFlags::None,
        });
        (section, symbol)
    }

    fn reloc(
        &mut self,
        section: write::SectionId,
        offset: u64,
        symbol: write::SymbolId,
        r_type: u32,
        addend: i64,
    ) {
        self.obj
            .add_relocation(
                section,
                write::Relocation {
                    offset,
                    symbol,
                    addend,
                    flags: RelocationFlags::Elf { r_type },
                },
            )
            .unwrap();
    }

    fn build(self) -> Vec<u8> {
        self.obj.write().unwrap()
    }
}

/// A running image containing a global `frob` and, under `test.c`, local
/// functions `tick` and `bar`. Sizes are all comfortably patchable.
fn running_image() -> Vec<u8> {
    let mut obj = write::Object::new(
        BinaryFormat::Elf,
        Architecture::X86_64,
        Endianness::Little,
    );
    obj.add_file_symbol(b"test.c".to_vec());
    let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    obj.append_section_data(text, &[0x90; 0x100], 16);

    let mut sym = |name: &str, value: u64, scope: SymbolScope| {
        obj.add_symbol(write::Symbol {
            name: name.as_bytes().to_vec(),
            value,
            size: 0x20,
            kind: SymbolKind::Text,
            scope,
            weak: false,
            section: write::SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
    };
    sym("tick", 0x20, SymbolScope::Compilation);
    sym("bar", 0x40, SymbolScope::Compilation);
    sym("frob", 0x60, SymbolScope::Linkage);
    sym("sysctl_print_dir", 0x80, SymbolScope::Linkage);
    obj.write().unwrap()
}

const BODY_A: &[u8] = &[0x55, 0x48, 0x89, 0xe5, 0x90, 0x5d, 0xc3];
const BODY_B: &[u8] = &[0x55, 0x48, 0x89, 0xe5, 0x66, 0x5d, 0xc3];
const BODY_C: &[u8] = &[0x31, 0xc0, 0x90, 0x90, 0x90, 0x90, 0xc3];

#[test]
fn identical_inputs_report_no_changes() {
    let build = || {
        let mut b = Builder::new();
        b.func("frob", BODY_A, SymbolScope::Linkage);
        b.func("bar", BODY_C, SymbolScope::Compilation);
        b.build()
    };
    let err = create_diff(&build(), &build(), &running_image(), false).unwrap_err();
    assert!(err.is::<NoChanges>());
}

#[test]
fn single_function_body_change() {
    let build = |body: &[u8]| {
        let mut b = Builder::new();
        b.func("frob", body, SymbolScope::Linkage);
        b.func("bar", BODY_C, SymbolScope::Compilation);
        b.build()
    };
    let out = create_diff(&build(BODY_A), &build(BODY_B), &running_image(), true).unwrap();
    let patch = object::File::parse(&*out).unwrap();

    let names: Vec<String> = patch
        .sections()
        .filter_map(|s| s.name().ok().map(str::to_owned))
        .collect();
    assert!(names.iter().any(|n| n == ".text.frob"));
    assert!(names.iter().all(|n| n != ".text.bar"));
    assert!(names.iter().any(|n| n == ".xsplice.funcs"));
    assert!(names.iter().any(|n| n == ".xsplice.strings"));

    let funcs = patch.section_by_name(".xsplice.funcs").unwrap();
    let data = funcs.data().unwrap();
    assert_eq!(data.len(), 64);
    let old_addr = u64::from_le_bytes(data[0..8].try_into().unwrap());
    let new_addr = u64::from_le_bytes(data[8..16].try_into().unwrap());
    let old_size = u32::from_le_bytes(data[16..20].try_into().unwrap());
    let new_size = u32::from_le_bytes(data[20..24].try_into().unwrap());
    // --resolve prefilled the old address from the running image.
    assert_eq!(old_addr, 0x60);
    assert_eq!(new_addr, 0);
    assert_eq!(old_size, 0x20);
    assert_eq!(new_size, BODY_B.len() as u32);

    // new_addr and name get filled by absolute relocations: one against the
    // patched function, one against the string pool.
    let relocs: Vec<_> = funcs.relocations().collect();
    assert_eq!(relocs.len(), 2);
    let target_symbol = |target: RelocationTarget| match target {
        RelocationTarget::Symbol(index) => patch.symbol_by_index(index).unwrap(),
        _ => panic!("unexpected relocation target"),
    };
    assert_eq!(relocs[0].0, 8);
    assert_eq!(target_symbol(relocs[0].1.target()).name().unwrap(), "frob");
    assert_eq!(relocs[1].0, 24);
    // The name slot is relocated against the string pool's section symbol.
    let strings_target = target_symbol(relocs[1].1.target());
    let strings_section = match strings_target.section() {
        object::SymbolSection::Section(index) => patch.section_by_index(index).unwrap(),
        section => panic!("unexpected symbol section {section:?}"),
    };
    assert_eq!(strings_section.name().unwrap(), ".xsplice.strings");
    assert_eq!(relocs[1].1.addend(), 0);

    // Globals keep their bare name in the string pool.
    let strings = patch.section_by_name(".xsplice.strings").unwrap();
    assert_eq!(strings.data().unwrap(), b"frob\0");
}

#[test]
fn unresolved_old_addr_is_left_for_the_loader() {
    let build = |body: &[u8]| {
        let mut b = Builder::new();
        b.func("frob", body, SymbolScope::Linkage);
        b.build()
    };
    let out = create_diff(&build(BODY_A), &build(BODY_B), &running_image(), false).unwrap();
    let patch = object::File::parse(&*out).unwrap();
    let funcs = patch.section_by_name(".xsplice.funcs").unwrap();
    let data = funcs.data().unwrap();
    assert_eq!(u64::from_le_bytes(data[0..8].try_into().unwrap()), 0);
    // old_size still comes from the lookup table.
    assert_eq!(u32::from_le_bytes(data[16..20].try_into().unwrap()), 0x20);
}

#[test]
fn mangled_function_rename_correlates_identical_bodies() {
    let base = {
        let mut b = Builder::new();
        b.func("sysctl_print_dir", BODY_A, SymbolScope::Compilation);
        b.build()
    };
    let patched = {
        let mut b = Builder::new();
        b.func("sysctl_print_dir.isra.2", BODY_A, SymbolScope::Compilation);
        b.build()
    };
    let err = create_diff(&base, &patched, &running_image(), false).unwrap_err();
    assert!(err.is::<NoChanges>(), "got: {err:#}");
}

#[test]
fn static_local_resuffix_correlates_and_patches_only_the_function() {
    let build = |suffix: &str, body: &[u8]| {
        let mut b = Builder::new();
        let (tick_sec, _) = b.func("tick", body, SymbolScope::Compilation);
        let counter_name = format!("counter.{suffix}");
        let (_, counter) = b.data_object(
            &format!(".data.{counter_name}"),
            &counter_name,
            &[0; 8],
            SectionKind::Data,
        );
        b.reloc(tick_sec, 2, counter, elf::R_X86_64_64, 0);
        b.build()
    };
    let base = build("7", BODY_A);
    let patched = build("9", BODY_B);
    let out = create_diff(&base, &patched, &running_image(), false).unwrap();
    let patch = object::File::parse(&*out).unwrap();

    let names: Vec<String> = patch
        .sections()
        .filter_map(|s| s.name().ok().map(str::to_owned))
        .collect();
    assert!(names.iter().any(|n| n == ".text.tick"));
    // The variable itself is unchanged data and stays in the running image.
    assert!(names.iter().all(|n| !n.starts_with(".data.counter")));

    // The patched symbol was renamed to the base suffix, then mangled with
    // the file hint like every local.
    let symbol_names: Vec<String> = patch
        .symbols()
        .filter_map(|s| s.name().ok().map(str::to_owned))
        .collect();
    assert!(symbol_names.iter().any(|n| n == "test.c#counter.7"));
    assert!(symbol_names.iter().all(|n| !n.contains("counter.9")));
    assert!(symbol_names.iter().any(|n| n == "test.c#tick"));

    // Locals are resolved through the file hint and recorded mangled.
    let strings = patch.section_by_name(".xsplice.strings").unwrap();
    assert_eq!(strings.data().unwrap(), b"test.c#tick\0");
}

#[test]
fn ignored_function_is_left_out_of_the_patch() {
    let build = |frob_body: &[u8], bar_body: &[u8], ignore_bar: bool| {
        let mut b = Builder::new();
        b.func("frob", frob_body, SymbolScope::Linkage);
        let (_, bar) = b.func("bar", bar_body, SymbolScope::Compilation);
        if ignore_bar {
            let sec = b.obj.add_section(
                Vec::new(),
                b".xsplice.ignore.functions".to_vec(),
                SectionKind::ReadOnlyData,
            );
            b.obj.append_section_data(sec, &[0; 8], 8);
            b.reloc(sec, 0, bar, elf::R_X86_64_64, 0);
        }
        b.build()
    };

    // Both functions changed, but bar is named in .xsplice.ignore.functions.
    let base = build(BODY_A, BODY_C, false);
    let patched = build(BODY_B, BODY_B, true);
    let out = create_diff(&base, &patched, &running_image(), false).unwrap();
    let patch = object::File::parse(&*out).unwrap();

    let funcs = patch.section_by_name(".xsplice.funcs").unwrap();
    assert_eq!(funcs.data().unwrap().len(), 64, "only frob should be patched");
    let names: Vec<String> = patch
        .sections()
        .filter_map(|s| s.name().ok().map(str::to_owned))
        .collect();
    assert!(names.iter().all(|n| n != ".text.bar"));
    let strings = patch.section_by_name(".xsplice.strings").unwrap();
    assert_eq!(strings.data().unwrap(), b"frob\0");
}

#[test]
fn ex_table_keeps_only_groups_touching_patched_code() {
    let ex_table_bytes: Vec<u8> = (0..16).collect();
    let build = |frob_body: &[u8]| {
        let mut b = Builder::new();
        let (_, frob) = b.func("frob", frob_body, SymbolScope::Linkage);
        let (_, bar) = b.func("bar", BODY_C, SymbolScope::Compilation);
        let ex_table = b.obj.add_section(
            Vec::new(),
            b".ex_table".to_vec(),
            SectionKind::ReadOnlyData,
        );
        b.obj.append_section_data(ex_table, &ex_table_bytes, 8);
        b.reloc(ex_table, 0, frob, elf::R_X86_64_64, 0);
        b.reloc(ex_table, 8, bar, elf::R_X86_64_64, 0);
        b.build()
    };

    let out = create_diff(&build(BODY_A), &build(BODY_B), &running_image(), false).unwrap();
    let patch = object::File::parse(&*out).unwrap();

    // Only the first 8-byte group references the patched function.
    let ex_table = patch.section_by_name(".ex_table").unwrap();
    assert_eq!(ex_table.data().unwrap(), &ex_table_bytes[..8]);
    let relocs: Vec<_> = ex_table.relocations().collect();
    assert_eq!(relocs.len(), 1);
    assert_eq!(relocs[0].0, 0);
}

#[test]
fn changed_data_section_is_an_unsupported_diff() {
    let build = |frob_body: &[u8], value: u8| {
        let mut b = Builder::new();
        b.func("frob", frob_body, SymbolScope::Linkage);
        b.data_object(".data.state", "state", &[value; 8], SectionKind::Data);
        b.build()
    };
    let err = create_diff(
        &build(BODY_A, 0),
        &build(BODY_B, 1),
        &running_image(),
        false,
    )
    .unwrap_err();
    assert!(err.is::<UnsupportedDiff>(), "got: {err:#}");
}

#[test]
fn missing_lookup_entry_is_fatal() {
    let build = |body: &[u8]| {
        let mut b = Builder::new();
        b.func("not_in_image", body, SymbolScope::Linkage);
        b.build()
    };
    let err = create_diff(&build(BODY_A), &build(BODY_B), &running_image(), false).unwrap_err();
    assert!(!err.is::<NoChanges>());
    assert!(!err.is::<UnsupportedDiff>());
    assert!(format!("{err:#}").contains("not_in_image"));
}

#[test]
fn patch_object_symbols_are_in_link_order() {
    let build = |body: &[u8]| {
        let mut b = Builder::new();
        b.func("frob", body, SymbolScope::Linkage);
        b.func("bar", BODY_C, SymbolScope::Compilation);
        b.build()
    };
    let out = create_diff(&build(BODY_A), &build(BODY_B), &running_image(), false).unwrap();
    let patch = object::File::parse(&*out).unwrap();

    // All locals precede all globals in the rewritten symbol table.
    let mut seen_global = false;
    for symbol in patch.symbols() {
        if symbol.is_global() {
            seen_global = true;
        } else {
            assert!(!seen_global, "local symbol after a global one");
        }
    }
}
