//! skiff CLI
//!
//! Thin glue over the library: resolves credentials (flags or the saved
//! host store), opens a transport, queues transfer tasks, and renders the
//! progress snapshot stream.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;

use skiff::config::{
    decrypt_private_key, encrypt_private_key, HostEntry, HostStore, SettingsStore,
};
use skiff::sftp::{path_utils, RemoteFs, SftpSession, TaskKind, TaskProgress, TaskQueue};
use skiff::ssh::{AuthMethod, SshClient, SshConfig};

#[derive(Parser)]
#[command(name = "skiff", version, about = "SSH/SFTP client with a concurrent transfer engine")]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Always use the native SFTP engine, never rsync
    /// (overrides the stored setting)
    #[arg(long, global = true)]
    no_rsync: bool,

    /// Maximum concurrent tasks (overrides the stored setting)
    #[arg(long, global = true)]
    max_tasks: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct ConnectionArgs {
    /// Name of a saved host (see `skiff host`)
    #[arg(long, global = true)]
    saved: Option<String>,

    #[arg(long, global = true)]
    host: Option<String>,

    #[arg(short = 'p', long, global = true, default_value_t = 22)]
    port: u16,

    #[arg(short = 'u', long, global = true)]
    user: Option<String>,

    #[arg(long, global = true)]
    password: Option<String>,

    /// Private key file
    #[arg(short = 'i', long, global = true)]
    key: Option<PathBuf>,

    /// Passphrase for the key (file passphrase, or the saved host's
    /// encryption passphrase)
    #[arg(long, global = true)]
    passphrase: Option<String>,

    /// Refuse connections to hosts missing from known_hosts
    #[arg(long, global = true)]
    strict_host_key: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Upload a local file or directory into a remote directory
    Put {
        source: PathBuf,
        /// Remote destination directory
        dest: String,
    },
    /// Download a remote file or directory into a local directory
    Get {
        source: String,
        /// Local destination directory
        dest: PathBuf,
    },
    /// List a remote directory
    Ls {
        #[arg(default_value = ".")]
        path: String,
    },
    /// Remove a remote file or directory tree
    Rm { path: String },
    /// Rename a remote file or directory
    Mv { from: String, to: String },
    /// Manage saved hosts
    Host {
        #[command(subcommand)]
        action: HostAction,
    },
}

#[derive(Subcommand)]
enum HostAction {
    /// Save the connection given by --host/--user/... under NAME.
    /// A key passed with -i is encrypted with --passphrase before storage.
    Save { name: String },
    List,
    Remove { name: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    skiff::init_logging();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("skiff: {}", e);
            ExitCode::FAILURE
        }
    }
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

async fn run(cli: Cli) -> CliResult {
    if let Command::Host { ref action } = cli.command {
        return run_host_command(&cli.connection, action).await;
    }

    let config = resolve_config(&cli.connection).await?;
    let transport = SshClient::new(config.clone()).connect().await?;
    let session = Arc::new(SftpSession::open(&transport).await?);

    let result = match cli.command {
        Command::Ls { ref path } => list_directory(&session, path).await,
        Command::Rm { ref path } => {
            if session.stat(path).await?.is_dir {
                session.remove_dir_all(path).await?;
            } else {
                session.remove_file(path).await?;
            }
            Ok(())
        }
        Command::Mv { ref from, ref to } => {
            session.rename(from, to).await?;
            Ok(())
        }
        Command::Put { ref source, ref dest } => {
            let name = source
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or("source has no file name")?;
            let kind = if tokio::fs::metadata(source).await?.is_dir() {
                TaskKind::UploadDir
            } else {
                TaskKind::UploadFile
            };
            let dest = path_utils::join_remote_path(dest, &name);
            run_transfer(
                &cli,
                config,
                session.clone(),
                kind,
                source.to_string_lossy().as_ref(),
                &dest,
                &name,
            )
            .await
        }
        Command::Get { ref source, ref dest } => {
            let name = path_utils::remote_file_name(source);
            let kind = if session.stat(source).await?.is_dir {
                TaskKind::DownloadDir
            } else {
                TaskKind::DownloadFile
            };
            tokio::fs::create_dir_all(dest).await?;
            let dest = dest.join(&name);
            run_transfer(
                &cli,
                config,
                session.clone(),
                kind,
                source,
                dest.to_string_lossy().as_ref(),
                &name,
            )
            .await
        }
        Command::Host { .. } => unreachable!("handled above"),
    };

    let _ = transport.disconnect().await;
    result
}

/// Resolve the SSH configuration from flags or the saved-host store
async fn resolve_config(args: &ConnectionArgs) -> Result<SshConfig, Box<dyn std::error::Error>> {
    if let Some(ref saved) = args.saved {
        let store = HostStore::open_default().await?;
        let entry = store
            .get(saved)
            .ok_or_else(|| format!("no saved host {:?}", saved))?;

        let auth = if let (Some(blob), Some(salt)) =
            (&entry.private_key_encrypted, &entry.key_encryption_salt)
        {
            let passphrase = args
                .passphrase
                .as_deref()
                .ok_or("--passphrase required for this host's encrypted key")?;
            let pem = decrypt_private_key(blob, salt, passphrase)?;
            AuthMethod::key(pem.to_vec(), None)
        } else if let Some(ref path) = entry.private_key_path {
            AuthMethod::key(tokio::fs::read(path).await?, args.passphrase.clone())
        } else if let Some(ref password) = entry.password {
            AuthMethod::password(password.clone())
        } else {
            return Err(format!("saved host {:?} has no credentials", saved).into());
        };

        return Ok(SshConfig {
            host: entry.host,
            port: entry.port,
            username: entry.username,
            auth,
            strict_host_key_checking: args.strict_host_key,
            ..Default::default()
        });
    }

    let host = args.host.clone().ok_or("--host or --saved is required")?;
    let username = args.user.clone().ok_or("--user is required")?;

    let auth = if let Some(ref key) = args.key {
        AuthMethod::key(tokio::fs::read(key).await?, args.passphrase.clone())
    } else if let Some(ref password) = args.password {
        AuthMethod::password(password.clone())
    } else {
        return Err("--password or --key is required".into());
    };

    Ok(SshConfig {
        host,
        port: args.port,
        username,
        auth,
        strict_host_key_checking: args.strict_host_key,
        ..Default::default()
    })
}

async fn run_transfer(
    cli: &Cli,
    config: SshConfig,
    session: Arc<SftpSession>,
    kind: TaskKind,
    source: &str,
    dest: &str,
    name: &str,
) -> CliResult {
    // Stored settings are the baseline; flags override per invocation
    let mut settings = SettingsStore::open_default()?.load().await;
    if let Some(max_tasks) = cli.max_tasks {
        settings.max_concurrent_tasks = max_tasks;
    }
    if cli.no_rsync {
        settings.disable_rsync = true;
    }

    let (tx, mut rx) = mpsc::channel::<TaskProgress>(256);
    let queue = TaskQueue::new(session, config, settings, tx);
    let task_id = queue.queue_task(kind, source, dest, name)?;

    // Render the snapshot stream until the terminal state arrives
    let mut failed = None;
    while let Some(progress) = rx.recv().await {
        if progress.task_id != task_id {
            continue;
        }
        render_progress(&progress);
        if progress.state.is_terminal() {
            eprintln!();
            failed = progress.error;
            break;
        }
    }

    match failed {
        Some(error) => {
            for line in queue.task_log(task_id) {
                eprintln!("  {}", line);
            }
            Err(error.into())
        }
        None => Ok(()),
    }
}

fn render_progress(progress: &TaskProgress) {
    let detail = if progress.total_bytes > 0 {
        format!(
            "{}/{} files, {}/{}",
            progress.completed_files,
            progress.total_files,
            format_bytes(progress.bytes_transferred),
            format_bytes(progress.total_bytes),
        )
    } else {
        progress.last_log.clone()
    };

    eprint!(
        "\r\x1b[2K[{:?}] {:>3}%  {}  {}/s",
        progress.state,
        progress.percentage,
        detail,
        format_bytes(progress.current_speed as u64),
    );
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

async fn list_directory(session: &SftpSession, path: &str) -> CliResult {
    let path = session.canonicalize(path).await?;
    let mut entries = session.read_dir(&path).await?;
    entries.sort_by(|a, b| {
        b.is_dir
            .cmp(&a.is_dir)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });

    for entry in entries {
        if entry.is_dir {
            println!("{:>10}  {}/", "-", entry.name);
        } else {
            println!("{:>10}  {}", format_bytes(entry.size), entry.name);
        }
    }
    Ok(())
}

async fn run_host_command(args: &ConnectionArgs, action: &HostAction) -> CliResult {
    let store = HostStore::open_default().await?;

    match action {
        HostAction::Save { name } => {
            let host = args.host.clone().ok_or("--host is required")?;
            let username = args.user.clone().ok_or("--user is required")?;

            let mut entry = HostEntry::new(name, &host, args.port, &username);
            if let Some(ref key) = args.key {
                let passphrase = args
                    .passphrase
                    .as_deref()
                    .ok_or("--passphrase required to encrypt the key at rest")?;
                let pem = tokio::fs::read(key).await?;
                let (blob, salt) = encrypt_private_key(&pem, passphrase)?;
                entry.set_encrypted_key(blob, salt);
            } else if let Some(ref password) = args.password {
                entry.password = Some(password.clone());
            } else {
                return Err("--password or --key is required".into());
            }

            store.upsert(entry).await?;
            println!("Saved host {:?}", name);
        }
        HostAction::List => {
            for entry in store.list() {
                let auth = if entry.private_key_encrypted.is_some() {
                    "encrypted key"
                } else if entry.private_key_path.is_some() {
                    "key file"
                } else {
                    "password"
                };
                println!(
                    "{:<16} {}@{}:{} ({})",
                    entry.name, entry.username, entry.host, entry.port, auth
                );
            }
        }
        HostAction::Remove { name } => {
            store.remove(name).await?;
            println!("Removed host {:?}", name);
        }
    }
    Ok(())
}
