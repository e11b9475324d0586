//! bedrock demo - run a journaled workload against a file-backed device
//!
//! Creates (or reuses) a device image, opens a journal over it, runs a
//! number of transactions that dirty metadata blocks, commits them with
//! ordered or durable semantics, and prints the journal statistics as JSON.

use std::path::PathBuf;
use std::sync::Arc;

use log::info;

use bedrock::{BlockDevice, CommitMode, FileDevice, Journal, JournalBuffer, JournalConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();

    let mut image = PathBuf::from("./bedrock.img");
    let mut txns: u32 = 16;
    let mut buffers_per_txn: u32 = 4;
    let mut durable = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--image" | "-i" => {
                if i + 1 < args.len() {
                    image = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--txns" | "-t" => {
                if i + 1 < args.len() {
                    txns = args[i + 1].parse()?;
                    i += 1;
                }
            }
            "--buffers" | "-b" => {
                if i + 1 < args.len() {
                    buffers_per_txn = args[i + 1].parse()?;
                    i += 1;
                }
            }
            "--durable" | "-D" => {
                durable = true;
            }
            "--help" | "-h" => {
                println!("bedrock - block-level write-ahead journaling demo");
                println!();
                println!("Usage: bedrock [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -i, --image FILE      Device image path (default: ./bedrock.img)");
                println!("  -t, --txns N          Transactions to commit (default: 16)");
                println!("  -b, --buffers N       Metadata buffers per transaction (default: 4)");
                println!("  -D, --durable         Use durable (DSYNC) commits");
                println!("  -h, --help            Show this help");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    let config = JournalConfig::default();
    let device_blocks = config.maxlen + 1024;
    info!("creating device image {:?} ({} blocks)", image, device_blocks);
    let device = Arc::new(FileDevice::create(&image, config.block_size, device_blocks)?);
    let block_size = config.block_size;
    let journal = Journal::create(device as Arc<dyn BlockDevice>, None, config)?;

    let mode = if durable { CommitMode::Dsync } else { CommitMode::Osync };
    info!("running {} transactions ({:?} commits)", txns, mode);

    // Home locations for metadata start past the log area.
    let mut next_home: u64 = 1100;
    for txn_index in 0..txns {
        let handle = journal.start(buffers_per_txn)?;
        for buffer_index in 0..buffers_per_txn {
            let fill = (txn_index * buffers_per_txn + buffer_index) as u8;
            let buf = JournalBuffer::new(next_home, vec![fill; block_size]);
            next_home += 1;
            handle.get_write_access(&buf)?;
            handle.dirty_metadata(&buf)?;
        }
        let tid = handle.tid();
        handle.stop()?;
        journal.log_start_optfs_commit(tid, mode);
        journal.log_wait_commit(tid)?;
    }

    // Push committed buffers to their home locations and reclaim the log.
    journal.checkpoint_writeback()?;

    let stats = journal.stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
