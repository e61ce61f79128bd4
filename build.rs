use anyhow::Result;
use vergen_gix::{BuildBuilder, CargoBuilder, Emitter, GixBuilder};

fn main() -> Result<()> {
    let mut gix = GixBuilder::default();
    gix.sha(true).branch(true);

    let build = BuildBuilder::all_build()?;
    let cargo = CargoBuilder::default().target_triple(true).build()?;

    Emitter::default()
        .add_instructions(&build)?
        .add_instructions(&cargo)?
        .add_instructions(&gix.build()?)?
        .emit()?;
    Ok(())
}
