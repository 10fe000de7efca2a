//! Command-line client for keepsake.

mod api_client;

use anyhow::{Context, Result};
use api_client::{ApiClient, ApiFailure, CapabilitiesResponse};
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use keepsake_core::upload::{BeginUploadRequest, FinishUploadRequest};
use keepsake_core::{AssetVariant, CapsuleId, ContentHash, MemoryId, PendingAssetMetadata, SessionState};
use std::collections::BTreeSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Read size used while hashing a file.
const HASH_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Parser)]
#[command(name = "keepsakectl")]
#[command(about = "Upload and fetch keepsake assets")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    api: ApiArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct ApiArgs {
    /// Server API URL
    #[arg(long, env = "KEEPSAKE_SERVER", global = true)]
    server: Option<String>,

    /// Bearer token
    #[arg(long, env = "KEEPSAKE_TOKEN", global = true, hide_env_values = true)]
    token: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Capsule management commands
    Capsule {
        #[command(subcommand)]
        command: CapsuleCommands,
    },
    /// Upload a file in chunks, resuming an interrupted upload of the same file
    Upload(UploadArgs),
    /// Show the progress of an upload session
    Status {
        /// Session ID
        session_id: String,
    },
    /// Abort an upload session
    Abort {
        /// Session ID
        session_id: String,
    },
    /// Download a variant of a memory
    Fetch {
        /// Memory ID
        memory_id: String,
        /// Variant name (original, display, thumbnail, placeholder, metadata)
        #[arg(default_value = "original", value_parser = parse_variant)]
        variant: AssetVariant,
        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Only accept a copy stored inline
        #[arg(long, default_value_t = false)]
        inline: bool,
    },
    /// Show the server's upload limits
    Capabilities,
}

#[derive(Subcommand)]
enum CapsuleCommands {
    /// Create a capsule owned by the caller
    Create,
    /// Let another principal write into a capsule
    Grant {
        /// Capsule ID
        capsule_id: String,
        /// Principal to grant
        principal: String,
    },
}

#[derive(Args)]
struct UploadArgs {
    /// File to upload
    file: PathBuf,
    /// Target capsule ID
    #[arg(long)]
    capsule: String,
    /// Asset variant
    #[arg(long, default_value = "original", value_parser = parse_variant)]
    variant: AssetVariant,
    /// Existing memory to attach the asset to (default: a new memory)
    #[arg(long)]
    memory: Option<String>,
    /// MIME type of the asset
    #[arg(long, default_value = "application/octet-stream")]
    mime: String,
    /// Chunk size in bytes (default: the server's advertised default)
    #[arg(long)]
    chunk_size: Option<u64>,
    /// Idempotency key (default: the file's SHA-256)
    #[arg(long)]
    idempotency_key: Option<String>,
    /// Remove older assets of the same variant once this one is stored
    #[arg(long, default_value_t = false)]
    replace: bool,
    /// Comma-separated tags
    #[arg(long, value_delimiter = ',')]
    tags: Vec<String>,
    /// Chunks sent concurrently
    #[arg(long, default_value_t = 4)]
    parallel: usize,
}

fn parse_variant(s: &str) -> Result<AssetVariant, String> {
    AssetVariant::parse(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let Cli { api, command } = Cli::parse();
    let client = get_api_client(&api)?;

    match command {
        Commands::Capsule { command } => handle_capsule_command(&client, command).await,
        Commands::Upload(args) => handle_upload_command(&client, args).await,
        Commands::Status { session_id } => handle_status_command(&client, &session_id).await,
        Commands::Abort { session_id } => {
            client.abort_upload(&session_id).await?;
            println!("Aborted upload session {session_id}");
            Ok(())
        }
        Commands::Fetch {
            memory_id,
            variant,
            output,
            inline,
        } => handle_fetch_command(&client, &memory_id, variant, output.as_deref(), inline).await,
        Commands::Capabilities => {
            let caps = client.capabilities().await?;
            render_capabilities(&caps);
            Ok(())
        }
    }
}

fn get_api_client(api: &ApiArgs) -> Result<ApiClient> {
    match (&api.server, &api.token) {
        (Some(server), Some(token)) => ApiClient::new(&normalize_base_url(server)?, token),
        (Some(_), None) | (None, Some(_)) => {
            anyhow::bail!("missing paired setting: provide both --server and --token");
        }
        (None, None) => {
            anyhow::bail!("--server and --token (or KEEPSAKE_SERVER and KEEPSAKE_TOKEN) are required")
        }
    }
}

fn normalize_base_url(url: &str) -> Result<String> {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        anyhow::bail!("server URL must not be empty");
    }
    Ok(trimmed.to_string())
}

async fn handle_capsule_command(client: &ApiClient, command: CapsuleCommands) -> Result<()> {
    match command {
        CapsuleCommands::Create => {
            let capsule = client.create_capsule().await?;
            println!("Capsule created:");
            println!("  ID:    {}", capsule.capsule_id);
            println!("  Owner: {}", capsule.owner);
        }
        CapsuleCommands::Grant {
            capsule_id,
            principal,
        } => {
            client.grant_writer(&capsule_id, &principal).await?;
            println!("Granted write access on {capsule_id} to {principal}");
        }
    }
    Ok(())
}

async fn handle_status_command(client: &ApiClient, session_id: &str) -> Result<()> {
    let status = client.upload_status(session_id).await?;
    println!("Session:  {}", status.session_id);
    println!("State:    {}", status.state.as_str());
    println!(
        "Chunks:   {}/{}",
        status.received_chunk_count, status.declared_chunk_count
    );
    println!("Received: {}", format_bytes(status.received_bytes));
    if !status.missing_chunks.is_empty() {
        println!("Missing:  {}", format_indices(&status.missing_chunks));
    }
    println!("Expires:  {}", status.expires_at);
    Ok(())
}

/// Size and digest of a file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileDigest {
    size: u64,
    sha256: ContentHash,
}

async fn digest_file(path: &Path) -> Result<FileDigest> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = ContentHash::hasher();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        size += n as u64;
    }
    Ok(FileDigest {
        size,
        sha256: hasher.finalize(),
    })
}

/// Number of chunks needed for `size` bytes. An empty file is one empty chunk.
fn chunk_count(size: u64, chunk_size: u64) -> Result<u32> {
    if chunk_size == 0 {
        anyhow::bail!("chunk size must be greater than 0");
    }
    let count = size.div_ceil(chunk_size).max(1);
    u32::try_from(count).context("file needs more chunks than fit in a u32")
}

async fn read_chunk(
    file: &mut tokio::fs::File,
    index: u32,
    chunk_size: u64,
    file_size: u64,
) -> Result<Bytes> {
    let offset = u64::from(index) * chunk_size;
    let len = chunk_size.min(file_size.saturating_sub(offset));
    let len = usize::try_from(len).context("chunk size exceeds platform limits")?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut data = vec![0u8; len];
    file.read_exact(&mut data).await?;
    Ok(Bytes::from(data))
}

fn resolve_chunk_size(requested: Option<u64>, caps: &CapabilitiesResponse) -> Result<u64> {
    let chunk_size = requested.unwrap_or(caps.default_chunk_size);
    if chunk_size == 0 {
        anyhow::bail!("chunk size must be greater than 0");
    }
    if chunk_size > caps.max_chunk_size {
        anyhow::bail!(
            "chunk size {chunk_size} exceeds the server maximum of {}",
            caps.max_chunk_size
        );
    }
    Ok(chunk_size)
}

async fn handle_upload_command(client: &ApiClient, args: UploadArgs) -> Result<()> {
    let capsule_id = CapsuleId::parse(&args.capsule)?;
    let memory_id = args.memory.as_deref().map(MemoryId::parse).transpose()?;

    let caps = client.capabilities().await?;
    let chunk_size = resolve_chunk_size(args.chunk_size, &caps)?;

    let digest = digest_file(&args.file).await?;
    let chunks = chunk_count(digest.size, chunk_size)?;
    if chunks > caps.max_chunk_count {
        anyhow::bail!(
            "{} bytes in {chunk_size}-byte chunks needs {chunks} chunks, more than the server maximum of {}",
            digest.size,
            caps.max_chunk_count
        );
    }

    let mut asset = PendingAssetMetadata::new(args.variant, args.mime, digest.size);
    asset.memory_id = memory_id;
    asset.replace = args.replace;
    asset.tags = args.tags;

    let begin = BeginUploadRequest {
        capsule_id,
        chunk_count: chunks,
        idempotency_key: args
            .idempotency_key
            .unwrap_or_else(|| digest.sha256.to_hex()),
        asset,
    };
    let session = client.begin_upload(&begin).await?;
    let session_id = session.session_id.to_string();

    let missing: BTreeSet<u32> = match (session.resumed, session.state) {
        (false, _) => (0..chunks).collect(),
        (true, SessionState::Completed) => BTreeSet::new(),
        (true, SessionState::Open) => {
            let status = client.upload_status(&session_id).await?;
            if status.declared_chunk_count != chunks {
                anyhow::bail!(
                    "session {session_id} was begun with {} chunks but this upload has {chunks}; \
                     use the same --chunk-size or a new --idempotency-key",
                    status.declared_chunk_count
                );
            }
            status.missing_chunks.into_iter().collect()
        }
        (true, state) => {
            anyhow::bail!(
                "session {session_id} is {}; retry once it settles",
                state.as_str()
            )
        }
    };

    if session.resumed {
        println!(
            "Resuming session {session_id}: {} of {chunks} chunks to send",
            missing.len()
        );
    } else {
        println!("Started session {session_id}: {chunks} chunks");
    }

    upload_missing_chunks(
        client,
        &session_id,
        &args.file,
        &missing,
        chunk_size,
        digest.size,
        args.parallel,
    )
    .await?;

    let finish = FinishUploadRequest {
        expected_sha256: digest.sha256.to_hex(),
        total_length: digest.size,
    };
    let finished = match client.finish_upload(&session_id, &finish).await {
        Ok(finished) => finished,
        Err(e) => {
            if let Some(failure) = e.downcast_ref::<ApiFailure>()
                && failure.code == "checksum_mismatch"
            {
                eprintln!("The file changed during upload; session {session_id} is still open");
            }
            return Err(e);
        }
    };

    println!("Upload complete:");
    println!("  Asset:  {}", finished.asset_id);
    println!("  Memory: {}", finished.memory_id);
    println!("  Size:   {}", format_bytes(digest.size));
    println!("  SHA256: {}", digest.sha256);
    Ok(())
}

async fn upload_missing_chunks(
    client: &ApiClient,
    session_id: &str,
    path: &Path,
    missing: &BTreeSet<u32>,
    chunk_size: u64,
    file_size: u64,
    parallel: usize,
) -> Result<()> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let parallel = std::cmp::max(1, parallel);
    let mut in_flight = FuturesUnordered::new();

    for &index in missing {
        let data = read_chunk(&mut file, index, chunk_size, file_size).await?;
        in_flight.push(async move {
            client
                .put_chunk(session_id, index, data)
                .await
                .with_context(|| format!("chunk {index} upload failed"))
        });

        if in_flight.len() >= parallel
            && let Some(result) = in_flight.next().await
        {
            result?;
        }
    }

    while let Some(result) = in_flight.next().await {
        result?;
    }

    Ok(())
}

async fn handle_fetch_command(
    client: &ApiClient,
    memory_id: &str,
    variant: AssetVariant,
    output: Option<&Path>,
    inline: bool,
) -> Result<()> {
    let asset = client
        .fetch_asset(memory_id, variant.as_str(), inline)
        .await?;

    if let Some(expected) = &asset.sha256 {
        let actual = ContentHash::compute(&asset.data).to_hex();
        if !actual.eq_ignore_ascii_case(expected) {
            anyhow::bail!("downloaded bytes hash to {actual}, server reported {expected}");
        }
    }

    match output {
        Some(path) => {
            tokio::fs::write(path, &asset.data)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            eprintln!(
                "Wrote {} ({}, tier {}) to {}",
                format_bytes(asset.data.len() as u64),
                asset.content_type.as_deref().unwrap_or("unknown type"),
                asset.tier.as_deref().unwrap_or("unknown"),
                path.display()
            );
        }
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&asset.data).await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}

fn render_capabilities(caps: &CapabilitiesResponse) {
    println!("API version:        {}", caps.api_version);
    println!("Max chunk size:     {}", format_bytes(caps.max_chunk_size));
    println!("Default chunk size: {}", format_bytes(caps.default_chunk_size));
    println!("Max chunk count:    {}", caps.max_chunk_count);
    println!("Inline up to:       {}", format_bytes(caps.inline_max_bytes));
    println!("Internal up to:     {}", format_bytes(caps.internal_max_bytes));
    println!(
        "External tier:      {}",
        if caps.external_tier { "yes" } else { "no" }
    );
}

/// Render sorted indices with runs collapsed, e.g. `0-3, 7, 9-10`.
fn format_indices(indices: &[u32]) -> String {
    let mut parts = Vec::new();
    let mut iter = indices.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{start}-{end}"));
        }
    }
    parts.join(", ")
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn caps(default_chunk_size: u64, max_chunk_size: u64) -> CapabilitiesResponse {
        CapabilitiesResponse {
            max_chunk_size,
            default_chunk_size,
            max_chunk_count: 65_536,
            inline_max_bytes: 32 * 1024,
            internal_max_bytes: 64 * 1024 * 1024,
            external_tier: false,
            api_version: "v1".to_string(),
        }
    }

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0, 10).unwrap(), 1);
        assert_eq!(chunk_count(10, 10).unwrap(), 1);
        assert_eq!(chunk_count(11, 10).unwrap(), 2);
        assert!(chunk_count(10, 0).is_err());
        assert!(chunk_count(u64::MAX, 1).is_err());
    }

    #[test]
    fn test_resolve_chunk_size() {
        let caps = caps(1024, 4096);
        assert_eq!(resolve_chunk_size(None, &caps).unwrap(), 1024);
        assert_eq!(resolve_chunk_size(Some(4096), &caps).unwrap(), 4096);
        assert!(resolve_chunk_size(Some(4097), &caps).is_err());
        assert!(resolve_chunk_size(Some(0), &caps).is_err());
    }

    #[test]
    fn test_format_indices() {
        assert_eq!(format_indices(&[]), "");
        assert_eq!(format_indices(&[4]), "4");
        assert_eq!(format_indices(&[0, 1, 2, 3, 7, 9, 10]), "0-3, 7, 9-10");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 bytes");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(
            normalize_base_url("http://localhost:8080/").unwrap(),
            "http://localhost:8080"
        );
        assert!(normalize_base_url("  ").is_err());
    }

    #[test]
    fn test_parse_variant() {
        assert_eq!(parse_variant("thumbnail").unwrap(), AssetVariant::Thumbnail);
        assert!(parse_variant("thumb").is_err());
    }

    #[tokio::test]
    async fn test_digest_and_read_chunks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("photo.bin");
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        tokio::fs::write(&path, &data).await.unwrap();

        let digest = digest_file(&path).await.unwrap();
        assert_eq!(digest.size, 1000);
        assert_eq!(digest.sha256, ContentHash::compute(&data));

        let mut file = tokio::fs::File::open(&path).await.unwrap();
        // Out of order, and the short tail.
        let tail = read_chunk(&mut file, 2, 400, 1000).await.unwrap();
        assert_eq!(tail.as_ref(), &data[800..]);
        let first = read_chunk(&mut file, 0, 400, 1000).await.unwrap();
        assert_eq!(first.as_ref(), &data[..400]);
    }

    #[tokio::test]
    async fn test_digest_empty_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty");
        tokio::fs::write(&path, b"").await.unwrap();

        let digest = digest_file(&path).await.unwrap();
        assert_eq!(digest.size, 0);
        assert_eq!(digest.sha256, ContentHash::compute(b""));

        let mut file = tokio::fs::File::open(&path).await.unwrap();
        assert!(read_chunk(&mut file, 0, 64, 0).await.unwrap().is_empty());
    }
}
