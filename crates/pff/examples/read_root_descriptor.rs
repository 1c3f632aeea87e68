use clap::Parser;
use outlook_pff::PffFile;

mod args;

/// The store root descriptor.
const ROOT_DESCRIPTOR: u32 = 0x21;

fn main() -> anyhow::Result<()> {
    args::init_tracing();
    let args = args::Args::try_parse()?;
    let pff = PffFile::open(&args.file)?;

    let Some(root) = pff.descriptor(ROOT_DESCRIPTOR)? else {
        println!("No root descriptor");
        return Ok(());
    };
    println!("Root: 0x{:08X}", root.identifier);
    println!(" Data identifier: 0x{:08X}", root.data_identifier);
    println!(
        " Local descriptors identifier: 0x{:08X}",
        root.local_descriptors_identifier
    );

    let stream = pff.stream(root.data_identifier)?;
    let mut preview = vec![0_u8; 64.min(stream.len() as usize)];
    let count = stream.read_at(0, &mut preview)?;
    println!(" Stream: {} bytes, starts {:02X?}", stream.len(), &preview[..count]);

    for sub in pff.local_descriptors(&root)? {
        println!(
            " Sub-object 0x{:08X}: data 0x{:08X}",
            sub.identifier, sub.data_identifier
        );
    }

    Ok(())
}
