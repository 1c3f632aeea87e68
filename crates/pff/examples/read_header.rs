use clap::Parser;
use outlook_pff::{BlockKind, PffFile};

mod args;

fn main() -> anyhow::Result<()> {
    args::init_tracing();
    let args = args::Args::try_parse()?;
    let pff = PffFile::open(&args.file)?;

    println!("Variant: {:?}", pff.variant());
    println!("Encryption mode: {:?}", pff.encryption_mode());
    println!("Container size: {} bytes", pff.size());

    for kind in [BlockKind::Data, BlockKind::Page] {
        let ranges = pff.unallocated_blocks(kind)?;
        let total: u64 = ranges.iter().map(|(_, size)| size).sum();
        println!("Unallocated {kind:?}: {} ranges, {total} bytes", ranges.len());
    }

    Ok(())
}
