//! Command line front end: inspect packages, store them, or serve remote
//! uploads over the file bridge protocol.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ipa_server::cli::{Cli, Command, StoreArgs, is_http_url};
use ipa_server::{
    AppInfo, HttpRangeReader, Ingestor, InstallManifest, JsonLinesChannel, LocalFileReader,
    LocalStorage, PackageKind, ReadAt, RemoteFile, package,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Inspect { file } => inspect(&file).await,
        Command::Add { file, store, spool } => {
            let ingestor = ingestor(&store);
            let source = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("cannot open {}", file.display()))?;
            let size = source.metadata().await?.len();
            let name = file.file_name().map(|n| n.to_string_lossy().into_owned());
            let app = ingestor
                .ingest_upload(source, size, name.as_deref(), spool.into())
                .await?;
            print_json(&app)
        }
        Command::Listen {
            addr,
            store,
            deadline,
        } => listen(&addr, Arc::new(ingestor(&store)), deadline.map(Duration::from_secs)).await,
    }
}

fn ingestor(store: &StoreArgs) -> Ingestor<LocalStorage> {
    let storage = Arc::new(LocalStorage::new(&store.storage));
    let ingestor = Ingestor::new(storage, InstallManifest::default());
    match &store.public_url {
        Some(url) => ingestor.with_public_url(url.clone()),
        None => ingestor,
    }
}

async fn inspect(file: &str) -> Result<()> {
    if is_http_url(file) {
        // Handle remote package via HTTP Range requests
        let reader = Arc::new(HttpRangeReader::new(file.to_string()).await?);
        let app = describe(reader.clone(), reader.file_name()).await?;
        print_json(&app)?;
        eprintln!("Total bytes transferred: {}", format_size(reader.transferred_bytes()));
        Ok(())
    } else {
        let reader = Arc::new(LocalFileReader::new(Path::new(file))?);
        print_json(&describe(reader, Some(file)).await?)
    }
}

async fn describe<R: ReadAt + 'static>(reader: Arc<R>, name: Option<&str>) -> Result<AppInfo> {
    let size = reader.size().await?;
    let kind = PackageKind::detect(reader.clone(), size, name).await?;
    let package = package::parse(reader, size, kind).await?;
    Ok(AppInfo::new(package.as_ref(), kind))
}

async fn listen(
    addr: &str,
    ingestor: Arc<Ingestor<LocalStorage>>,
    deadline: Option<Duration>,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot listen on {addr}"))?;
    info!(addr, "waiting for uploads");

    loop {
        let (stream, peer) = listener.accept().await?;
        let ingestor = ingestor.clone();
        tokio::spawn(async move {
            let mut remote = RemoteFile::new(JsonLinesChannel::new(stream));
            if let Some(deadline) = deadline {
                remote = remote.with_deadline(deadline);
            }
            match ingestor.ingest_remote(Arc::new(remote)).await {
                Ok(app) => info!(%peer, id = %app.id, "remote upload stored"),
                Err(e) => error!(%peer, error = %e, "remote upload failed"),
            }
        });
    }
}

fn print_json(app: &AppInfo) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(app)?);
    Ok(())
}

/// Format a byte size into a human-readable string.
fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}
