use crate::cli::{Cli, Command};
use anyhow::Context;
use bitcoin::OutPoint;
use coins_cache::Coin;
use coins_db::CoinsDb;
use std::fs::File;
use std::io::{BufWriter, Write};

pub fn run(cli: Cli) -> anyhow::Result<()> {
    let Cli { db, command, .. } = cli;

    anyhow::ensure!(
        db.exists(),
        "Coins database {} does not exist",
        db.display()
    );

    let db = CoinsDb::open(&db)
        .with_context(|| format!("Failed to open coins database at {}", db.display()))?;

    let mut stdout = std::io::stdout().lock();

    match command {
        Command::Info => info(&db, &mut stdout),
        Command::Get { outpoint } => get(&db, outpoint, &mut stdout),
        Command::Dump { limit, csv } => {
            let dumped = match csv {
                Some(path) => {
                    tracing::info!("Dumping UTXO set to {}", path.display());
                    let mut file = BufWriter::new(File::create(&path)?);
                    let dumped = dump(&db, limit, &mut file)?;
                    file.flush()?;
                    dumped
                }
                None => dump(&db, limit, &mut stdout)?,
            };
            tracing::info!("Dumped {dumped} coins");
            Ok(())
        }
        Command::Undo { height } => undo(&db, height, &mut stdout),
    }
}

fn info(db: &CoinsDb, out: &mut impl Write) -> anyhow::Result<()> {
    let info = db.txout_set_info()?;

    writeln!(out, "best_block: {}", info.best_block)?;
    writeln!(out, "coins: {}", info.coins)?;
    writeln!(out, "total_amount: {}", info.total_amount.to_sat())?;
    writeln!(out, "serialized_size: {}", info.serialized_size)?;
    writeln!(out, "invalid_records: {}", info.invalid_records)?;

    Ok(())
}

fn get(db: &CoinsDb, outpoint: OutPoint, out: &mut impl Write) -> anyhow::Result<()> {
    let coin = db
        .read_coin(&outpoint)?
        .with_context(|| format!("Coin {outpoint} not found"))?;

    writeln!(out, "outpoint: {outpoint}")?;
    writeln!(out, "height: {}", coin.height())?;
    writeln!(out, "is_coinbase: {}", coin.is_coinbase())?;
    writeln!(out, "amount: {}", coin.amount().to_sat())?;
    writeln!(out, "script_pubkey: {}", hex::encode(coin.script_pubkey().as_bytes()))?;

    Ok(())
}

fn write_csv_row(out: &mut impl Write, outpoint: &OutPoint, coin: &Coin) -> std::io::Result<()> {
    let OutPoint { txid, vout } = outpoint;
    let script_pubkey = hex::encode(coin.script_pubkey().as_bytes());
    writeln!(
        out,
        "{txid},{vout},{},{},{},{script_pubkey}",
        coin.height(),
        coin.is_coinbase(),
        coin.amount().to_sat()
    )
}

/// Writes up to `limit` coins as CSV rows, returns the number of rows written.
fn dump(db: &CoinsDb, limit: Option<usize>, out: &mut impl Write) -> anyhow::Result<usize> {
    let limit = limit.unwrap_or(usize::MAX);
    let mut dumped = 0;

    for entry in db.iter_coins()? {
        if dumped >= limit {
            break;
        }

        match entry {
            Ok((outpoint, coin)) => {
                write_csv_row(out, &outpoint, &coin)?;
                dumped += 1;
            }
            Err(err) => tracing::warn!("Skipping invalid coin entry: {err}"),
        }
    }

    Ok(dumped)
}

fn undo(db: &CoinsDb, height: u32, out: &mut impl Write) -> anyhow::Result<()> {
    let undo = db
        .read_block_undo(height)?
        .with_context(|| format!("No undo data for block #{height}"))?;

    let spent_amount = undo
        .txs
        .iter()
        .flat_map(|tx_undo| &tx_undo.spent)
        .fold(0u64, |acc, coin| acc.saturating_add(coin.amount().to_sat()));

    writeln!(out, "height: {height}")?;
    writeln!(out, "transactions: {}", undo.txs.len())?;
    writeln!(out, "spent_coins: {}", undo.spent_count())?;
    writeln!(out, "spent_amount: {spent_amount}")?;

    Ok(())
}
