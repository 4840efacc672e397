use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)] // Read from `Cargo.toml`
pub struct Cli {
    /// Print the resolved configuration and exit.
    #[arg(long)]
    print_debug_info: bool,
}

impl Cli {
    pub fn init() -> Self {
        Self::parse()
    }

    pub fn print_debug_info(&self) -> bool {
        self.print_debug_info
    }
}
