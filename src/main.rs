mod cli;
mod wx_core;

use anyhow::{anyhow, Result};
use clap::Parser;
use cli::{Cli, Commands};
use colored::*;
use log::{error, info};
use std::path::PathBuf;

use wx_core::account::Account;
use wx_core::decryption::DbVersion;
use wx_core::utils::CancelToken;
use wx_core::validator::Validator;

const WXRECOVER_ASCII: &str = r"
 ██╗    ██╗██╗  ██╗██████╗ ███████╗ ██████╗
 ██║    ██║╚██╗██╔╝██╔══██╗██╔════╝██╔════╝
 ██║ █╗ ██║ ╚███╔╝ ██████╔╝█████╗  ██║
 ██║███╗██║ ██╔██╗ ██╔══██╗██╔══╝  ██║
 ╚███╔███╔╝██╔╝ ██╗██║  ██║███████╗╚██████╗
  ╚══╝╚══╝ ╚═╝  ╚═╝╚═╝  ╚═╝╚══════╝ ╚═════╝
";

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    println!("{}", WXRECOVER_ASCII.cyan());
    println!(
        "{}",
        format!(" WxRecover v{} ", env!("CARGO_PKG_VERSION")).cyan().on_black()
    );

    match cli.command {
        Commands::Info { save_path } => {
            info!("Running info command");
            match run_info(save_path) {
                Ok(accounts) => print_accounts(&accounts),
                Err(e) => error!("Error: {}", e),
            }
        }
        Commands::Decrypt {
            key,
            db_path,
            out_path,
            db_version,
        } => {
            info!("Running decrypt command");
            match run_decrypt(&key, &db_path, &out_path, db_version) {
                Ok(()) => {}
                Err(e) => error!("Error: {}", e),
            }
        }
        Commands::Validate {
            key,
            db_path,
            db_version,
        } => {
            info!("Running validate command");
            match run_validate(&key, &db_path, db_version) {
                Ok(true) => println!("{}", "[+] key is valid".green()),
                Ok(false) => println!("{}", "[-] key is NOT valid".red()),
                Err(e) => error!("Error: {}", e),
            }
        }
        Commands::Export {
            data_dir,
            key,
            out_path,
            db_version,
            image_xor_key,
            image_aes_key,
        } => {
            info!("Running export command");
            match run_export(
                &data_dir,
                &key,
                &out_path,
                db_version,
                image_xor_key,
                image_aes_key,
            ) {
                Ok(()) => println!("[+] exported to \"{}\"", out_path.display()),
                Err(e) => error!("Error: {}", e),
            }
        }
    }
}

fn parse_version(n: u32) -> Result<DbVersion> {
    DbVersion::from_number(n).ok_or_else(|| anyhow!("unsupported db version: {}", n))
}

fn run_decrypt(key: &str, db_path: &PathBuf, out_path: &PathBuf, db_version: u32) -> Result<()> {
    let version = parse_version(db_version)?;
    std::fs::create_dir_all(out_path)?;
    wx_core::decryption::batch_decrypt(version, key, db_path, out_path, true, &CancelToken::new())?;
    Ok(())
}

fn run_validate(key: &str, db_path: &PathBuf, db_version: u32) -> Result<bool> {
    let version = parse_version(db_version)?;
    let master = hex::decode(key.trim()).map_err(|_| anyhow!("key: '{}' Invalid hex!", key))?;
    let validator = Validator::with_file(version, db_path)?;
    Ok(validator.validate(&master))
}

fn run_export(
    data_dir: &PathBuf,
    key: &str,
    out_path: &PathBuf,
    db_version: u32,
    image_xor_key: Option<String>,
    image_aes_key: Option<String>,
) -> Result<()> {
    let version = parse_version(db_version)?;
    let account = Account {
        version: version.number(),
        data_dir: data_dir.to_string_lossy().into_owned(),
        key: key.to_uppercase(),
        image_xor_key: image_xor_key.unwrap_or_default(),
        image_aes_key: image_aes_key.unwrap_or_default(),
        ..Default::default()
    };
    wx_core::export::export_all(&account, out_path, &CancelToken::new())?;
    Ok(())
}

#[cfg(windows)]
fn run_info(save_path: Option<PathBuf>) -> Result<Vec<Account>> {
    let token = CancelToken::new();
    let mut accounts = wx_core::account::list_accounts()?;

    for account in accounts.iter_mut() {
        if !account.is_online() {
            continue;
        }
        info!("recovering keys for pid {}", account.pid);
        if let Err(e) = account.recover_keys(&token) {
            error!("key recovery failed for pid {}: {}", account.pid, e);
        }
    }

    if let Some(path) = save_path {
        save_accounts(&accounts, &path)?;
    }
    Ok(accounts)
}

#[cfg(not(windows))]
fn run_info(_save_path: Option<PathBuf>) -> Result<Vec<Account>> {
    Err(anyhow!("live account discovery requires Windows"))
}

#[cfg(windows)]
fn save_accounts(accounts: &[Account], path: &PathBuf) -> Result<()> {
    // Append to whatever an earlier run left behind.
    let mut all: Vec<Account> = if path.exists() {
        std::fs::File::open(path)
            .ok()
            .and_then(|f| serde_json::from_reader(f).ok())
            .unwrap_or_default()
    } else {
        Vec::new()
    };
    all.extend_from_slice(accounts);

    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(file, &all)?;
    Ok(())
}

fn print_accounts(accounts: &[Account]) {
    println!("{}", "=".repeat(32));
    for (i, account) in accounts.iter().enumerate() {
        println!("[+] {:>12}: {}", "wxid", account.wxid);
        println!("[+] {:>12}: {}", "account", account.wx_account);
        println!("[+] {:>12}: {}", "nickname", account.nickname);
        println!("[+] {:>12}: {}", "phone", account.phone);
        println!("[+] {:>12}: {}", "version", account.full_version);
        println!("[+] {:>12}: {}", "data dir", account.data_dir);
        println!("[+] {:>12}: {}", "key", account.key);
        if account.version == 4 {
            println!("[+] {:>12}: {}", "img xor key", account.image_xor_key);
            println!("[+] {:>12}: {}", "img aes key", account.image_aes_key);
        }
        println!("[+] {:>12}: {}", "pid", account.pid);
        println!("[+] {:>12}: {}", "status", account.status);
        if i < accounts.len() - 1 {
            println!("{}", "-".repeat(32));
        }
    }
    println!("{}", "=".repeat(32));
}
