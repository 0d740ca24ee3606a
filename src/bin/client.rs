//! Command-line client for a BlobVault server
//!
//! One subcommand per operation, plus an interactive shell. The server's
//! public key is cached in `<key-file>.pub` and fetched when missing.

use blobvault::protocol::parse_listing;
use blobvault::{Client, Credentials, Response};
use clap::{Parser, Subcommand};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about = "BlobVault command-line client", long_about = None)]
struct Cli {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:9999")]
    server: String,

    /// Base name of the cached server key (<name>.pub)
    #[arg(short = 'k', long, default_value = "rsa")]
    key_file: PathBuf,

    #[arg(short, long, default_value = "")]
    user: String,

    #[arg(short = 'w', long, default_value = "")]
    password: String,

    /// Write payloads here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Fetch the server's public key into the key file
    Key,
    /// Register a new user
    Reg,
    /// Shut the server down
    Bye,
    /// Compact the server's log
    Sav,
    /// Set your content from a file
    Set { file: PathBuf },
    /// Get a user's content
    Get { who: String },
    /// List all users
    All,
    /// Insert a key with the contents of a file
    Kvi { key: String, file: PathBuf },
    /// Get a key
    Kvg { key: String },
    /// Delete a key
    Kvd { key: String },
    /// Insert or update a key with the contents of a file
    Kvu { key: String, file: PathBuf },
    /// List all keys
    Kva,
    /// List the most recently used keys
    Kvt,
    /// Interactive session with text values
    Shell,
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn public_key_path(base: &Path) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(".pub");
    PathBuf::from(name)
}

async fn server_key(cli: &Cli, refresh: bool) -> Result<String, Box<dyn std::error::Error>> {
    let path = public_key_path(&cli.key_file);
    if !refresh {
        if let Ok(pem) = std::fs::read_to_string(&path) {
            return Ok(pem);
        }
    }
    let pem = Client::fetch_public_key(&cli.server).await?;
    std::fs::write(&path, pem.as_bytes())?;
    Ok(pem)
}

/// Returns whether the server answered with a success status
async fn run(cli: Cli) -> Result<bool, Box<dyn std::error::Error>> {
    if let Cmd::Key = cli.command {
        server_key(&cli, true).await?;
        println!("OK");
        return Ok(true);
    }

    let pem = server_key(&cli, false).await?;
    let mut client = Client::connect(&cli.server, &pem).await?;
    let creds = Credentials::new(cli.user.clone(), cli.password.clone());

    let response = match &cli.command {
        Cmd::Key => {
            client.close().await?;
            return Ok(true);
        }
        Cmd::Shell => {
            shell(&mut client, &creds).await?;
            client.close().await?;
            return Ok(true);
        }
        Cmd::Reg => client.register(&creds).await?,
        Cmd::Bye => client.shutdown(&creds).await?,
        Cmd::Sav => client.persist(&creds).await?,
        Cmd::Set { file } => client.set_content(&creds, std::fs::read(file)?).await?,
        Cmd::Get { who } => client.get_content(&creds, who).await?,
        Cmd::All => client.all_users(&creds).await?,
        Cmd::Kvi { key, file } => client.insert(&creds, key, std::fs::read(file)?).await?,
        Cmd::Kvg { key } => client.get(&creds, key).await?,
        Cmd::Kvd { key } => client.delete(&creds, key).await?,
        Cmd::Kvu { key, file } => client.upsert(&creds, key, std::fs::read(file)?).await?,
        Cmd::Kva => client.all_keys(&creds).await?,
        Cmd::Kvt => client.top_keys(&creds).await?,
    };

    println!("{}", response.status);
    if let Some(payload) = &response.payload {
        match &cli.output {
            Some(path) => std::fs::write(path, payload)?,
            None => {
                let mut stdout = io::stdout();
                stdout.write_all(payload)?;
                stdout.flush()?;
            }
        }
    }
    // The server may already have hung up after a shutdown
    let _ = client.close().await;
    Ok(response.status.is_ok())
}

async fn shell(client: &mut Client, creds: &Credentials) -> Result<(), Box<dyn std::error::Error>> {
    println!("Connected! Type 'help' for available commands or 'quit' to exit.");

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();

        if input.is_empty() {
            continue;
        }

        match input {
            "quit" | "exit" => {
                println!("Goodbye!");
                break;
            }
            "help" => print_help(),
            _ => match handle_command(client, creds, input).await {
                Ok(Some(response)) => print_response(&response),
                Ok(None) => {}
                Err(e) => println!("Error: {}", e),
            },
        }
    }
    Ok(())
}

async fn handle_command(
    client: &mut Client,
    creds: &Credentials,
    input: &str,
) -> Result<Option<Response>, Box<dyn std::error::Error>> {
    let parts: Vec<&str> = input.splitn(3, ' ').collect();

    let response = match parts.as_slice() {
        ["reg"] => client.register(creds).await?,
        ["sav"] => client.persist(creds).await?,
        ["set", content] => client.set_content(creds, content.as_bytes().to_vec()).await?,
        ["get", who] => client.get_content(creds, who).await?,
        ["all"] => client.all_users(creds).await?,
        ["kvi", key, value] => client.insert(creds, key, value.as_bytes().to_vec()).await?,
        ["kvg", key] => client.get(creds, key).await?,
        ["kvd", key] => client.delete(creds, key).await?,
        ["kvu", key, value] => client.upsert(creds, key, value.as_bytes().to_vec()).await?,
        ["kva"] => client.all_keys(creds).await?,
        ["kvt"] => client.top_keys(creds).await?,
        _ => {
            println!("Unknown command: {}. Type 'help' for available commands.", parts[0]);
            return Ok(None);
        }
    };
    Ok(Some(response))
}

fn print_response(response: &Response) {
    println!("{}", response.status);
    if let Some(payload) = &response.payload {
        if payload.ends_with(b"\n") {
            for entry in parse_listing(payload) {
                println!("  {}", entry);
            }
        } else {
            println!("{}", String::from_utf8_lossy(payload));
        }
    }
}

fn print_help() {
    println!("Available commands:");
    println!("  reg                 - Register the current user");
    println!("  sav                 - Compact the server log");
    println!("  set <content>       - Set your content");
    println!("  get <user>          - Get a user's content");
    println!("  all                 - List users");
    println!("  kvi <key> <value>   - Insert a key");
    println!("  kvg <key>           - Get a key");
    println!("  kvd <key>           - Delete a key");
    println!("  kvu <key> <value>   - Insert or update a key");
    println!("  kva                 - List keys");
    println!("  kvt                 - List most recently used keys");
    println!("  help                - Show this help message");
    println!("  quit                - Exit the client");
}
