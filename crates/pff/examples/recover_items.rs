use clap::Parser;
use outlook_pff::{PffFile, RecoveryFlags};

mod args;

fn main() -> anyhow::Result<()> {
    args::init_tracing();
    let args = args::Args::try_parse()?;
    let pff = PffFile::open(&args.file)?;

    pff.recover(RecoveryFlags {
        ignore_allocation_data: false,
        scan_for_fragments: true,
    })?;

    let items = pff.recovered_items();
    println!("Recovered {} items", items.len());
    for item in items {
        let kind = item
            .identifier_type()
            .map(|t| format!("{t:?}"))
            .unwrap_or_else(|| "Unknown".into());
        let size = pff
            .stream(item.data_identifier)
            .map(|stream| stream.len())
            .unwrap_or(0);
        println!(
            " 0x{:08X} ({kind}): parent 0x{:08X}, {size} bytes",
            item.identifier, item.parent_identifier
        );
    }

    Ok(())
}
