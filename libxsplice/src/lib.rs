//! Object-level differencing engine for xsplice live patches.
//!
//! Takes two relocatable objects compiled from the same source - a base and
//! a patched variant, built with `-ffunction-sections -fdata-sections` - and
//! produces a third object holding exactly the functions and supporting data
//! that changed, plus an `.xsplice.funcs` table telling the runtime loader
//! which functions in the running image to redirect.
//!
//! The pipeline is a linear sequence of passes over an in-memory object
//! model: correlate the two inputs, classify every element as same, changed
//! or new, pull in the transitive dependencies of every changed function,
//! regenerate the architecture's metadata sections at record granularity,
//! emit the patch table, and migrate the surviving elements into the output.

use crate::error::NoChanges;
use crate::error::Result;
use anyhow::Context as _;
use tracing::debug;

pub mod args;
pub(crate) mod compare;
pub(crate) mod correlate;
pub(crate) mod elf;
pub(crate) mod elf_writer;
pub mod error;
pub(crate) mod include;
pub(crate) mod insn;
pub mod lookup;
pub(crate) mod migrate;
pub(crate) mod parsing;
pub(crate) mod patch_table;
pub(crate) mod special_section;

pub use args::Args;

pub fn run(args: &Args) -> Result {
    let base = std::fs::read(&args.original)
        .with_context(|| format!("failed to read {}", args.original.display()))?;
    let patched = std::fs::read(&args.patched)
        .with_context(|| format!("failed to read {}", args.patched.display()))?;
    let image = std::fs::read(&args.running_image)
        .with_context(|| format!("failed to read {}", args.running_image.display()))?;

    let output = create_diff(&base, &patched, &image, args.resolve)?;

    // Reached only once every fallible pass has succeeded; a partial output
    // is never written.
    std::fs::write(&args.output, output)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    Ok(())
}

/// Runs the whole differencing pipeline and returns the serialized patch
/// object.
///
/// Fails with [`error::NoChanges`] when the inputs are equivalent and with
/// [`error::UnsupportedDiff`] when they differ in a way the patch format
/// cannot express.
pub fn create_diff(
    base: &[u8],
    patched: &[u8],
    running_image: &[u8],
    resolve: bool,
) -> Result<Vec<u8>> {
    debug!("open base");
    let mut base = parsing::parse_object(base).context("failed to load base object")?;
    debug!("open patched");
    let mut patched = parsing::parse_object(patched).context("failed to load patched object")?;

    debug!("compare elf headers");
    correlate::verify_compatible_headers(&base, &patched)?;
    debug!("mark grouped sections");
    correlate::mark_grouped_sections(&mut patched)?;
    debug!("replace section symbols in base");
    correlate::canonicalize_section_symbol_refs(&mut base)?;
    debug!("replace section symbols in patched");
    correlate::canonicalize_section_symbol_refs(&mut patched)?;
    debug!("rename mangled functions");
    correlate::rename_mangled_functions(&base, &mut patched);

    debug!("correlate objects");
    correlate::correlate_objects(&mut base, &mut patched);
    debug!("correlate static local variables");
    correlate::correlate_static_local_variables(&mut base, &mut patched)?;

    debug!("mark ignored sections");
    compare::mark_ignored_sections(&mut patched)?;
    debug!("compare correlated elements");
    compare::compare_correlated_elements(&mut patched, &base)?;

    // From here on the base model is only reachable through twin links,
    // which nothing past comparison follows.
    drop(base);

    debug!("mark ignored functions same");
    compare::mark_ignored_functions_same(&mut patched)?;
    debug!("mark ignored sections same");
    compare::mark_ignored_sections_same(&mut patched);
    debug!("mark constant labels same");
    compare::mark_constant_labels_same(&mut patched);

    debug!("include standard elements");
    include::include_standard_elements(&mut patched);
    debug!("include changed functions");
    let num_changed = include::include_changed_functions(&mut patched);
    debug!("num_changed = {num_changed}");
    debug!("include debug sections");
    include::include_debug_sections(&mut patched);
    debug!("include hook elements");
    include::include_hook_elements(&mut patched)?;
    debug!("include new globals");
    let new_globals = include::include_new_globals(&mut patched);
    debug!("new_globals = {new_globals}");

    include::report_changes(&patched);
    patched.dump();

    if num_changed == 0 && new_globals == 0 {
        debug!("no changed functions were found");
        return Err(NoChanges.into());
    }

    debug!("process special sections");
    special_section::process_special_sections(&mut patched)?;
    debug!("verify patchability");
    include::verify_patchability(&patched)?;

    debug!("migrate included elements");
    let mut out = migrate::migrate_included_elements(patched)?;

    debug!("search for source file name");
    let hint = out
        .symbols
        .iter()
        .find(|sym| sym.kind == object::elf::STT_FILE)
        .map(|sym| sym.name.clone())
        .context("FILE symbol not found in output, stripped?")?;
    debug!("hint = {hint}");

    debug!("load symbol table from running image");
    let table = lookup::LookupTable::parse(running_image)
        .context("failed to load running image symbol table")?;

    debug!("create strings elements");
    let (strings_sec, strings_sym) = patch_table::create_strings_elements(&mut out);
    debug!("create patches sections");
    patch_table::create_patches_sections(&mut out, &table, &hint, resolve, strings_sym)?;
    patch_table::build_strings_section_data(&mut out, strings_sec);
    debug!("rename local symbols");
    patch_table::rename_local_symbols(&mut out, &hint);

    debug!("reorder symbols");
    migrate::reorder_symbols(&mut out);
    debug!("reindex elements");
    migrate::reindex_elements(&mut out);

    debug!("write output elf");
    let bytes = elf_writer::write_output(&mut out)?;
    out.dump();
    Ok(bytes)
}
