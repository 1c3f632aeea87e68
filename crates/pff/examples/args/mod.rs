use clap::Parser;

#[derive(Parser)]
#[command(version, about, long_about)]
pub struct Args {
    /// Path to a PST/OST container.
    pub file: String,
}

pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();
}
