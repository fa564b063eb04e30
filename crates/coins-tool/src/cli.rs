use bitcoin::OutPoint;
use clap::Parser;
use std::path::PathBuf;

/// Coins Ledger Inspection Tool
#[derive(Debug, Parser)]
#[clap(version = "0.1.0")]
#[clap(about = "Inspect the UTXO set and undo data stored in a coins database")]
pub struct Cli {
    /// Path of the coins database.
    #[arg(long, short = 'd', value_name = "PATH")]
    pub db: PathBuf,

    /// Log filter directives, e.g. `coins_db=debug`.
    ///
    /// Falls back to `RUST_LOG`, then to `info`.
    #[arg(long, value_name = "FILTER")]
    pub log: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Statistics about the UTXO set.
    Info,

    /// Print a single coin.
    Get {
        /// Outpoint of the coin as `txid:vout`.
        outpoint: OutPoint,
    },

    /// Dump the UTXO set in CSV format.
    ///
    /// Columns: txid,vout,height,is_coinbase,amount,script_pubkey
    Dump {
        /// Stop after this many coins.
        #[clap(long)]
        limit: Option<usize>,

        /// Write to a file instead of stdout.
        #[clap(short, long, value_name = "PATH")]
        csv: Option<PathBuf>,
    },

    /// Summarize the undo data of a block.
    Undo {
        /// Height of the block.
        height: u32,
    },
}
