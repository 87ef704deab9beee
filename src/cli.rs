use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Discover accounts and recover their keys from live processes
    Info {
        /// (optional) save the recovered account records as JSON
        #[arg(short, long)]
        save_path: Option<PathBuf>,
    },

    /// Decrypt databases with a known master key
    Decrypt {
        /// Master key, 64 hex chars
        #[arg(short, long, required = true)]
        key: String,

        /// Database path (directory or file)
        #[arg(short, long, required = true)]
        db_path: PathBuf,

        /// Output path (must be a directory) [defaults to ./decrypted]
        #[arg(short, long, default_value = "decrypted")]
        out_path: PathBuf,

        /// On-disk format version (3 or 4)
        #[arg(short = 'V', long, default_value_t = 3)]
        db_version: u32,
    },

    /// Check a master key against one encrypted database
    Validate {
        /// Master key, 64 hex chars
        #[arg(short, long, required = true)]
        key: String,

        /// Encrypted database file
        #[arg(short, long, required = true)]
        db_path: PathBuf,

        /// On-disk format version (3 or 4)
        #[arg(short = 'V', long, default_value_t = 3)]
        db_version: u32,
    },

    /// Export a full plaintext mirror of one account's data directory
    Export {
        /// Account data directory (the wxid folder)
        #[arg(long, required = true)]
        data_dir: PathBuf,

        /// Master key, 64 hex chars
        #[arg(short, long, required = true)]
        key: String,

        /// Output directory
        #[arg(short, long, default_value = "exported")]
        out_path: PathBuf,

        /// On-disk format version (3 or 4)
        #[arg(short = 'V', long, default_value_t = 3)]
        db_version: u32,

        /// (optional) v4 image XOR key, e.g. 0X37
        #[arg(long)]
        image_xor_key: Option<String>,

        /// (optional) v4 image AES key, 16 ASCII chars
        #[arg(long)]
        image_aes_key: Option<String>,
    },
}
