mod client;
mod error;
mod qr;
mod urls;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::client::AdminClient;

const DEFAULT_COUNT: i64 = 10;
const DEFAULT_MAX_DOWNLOADS: i64 = 3;

#[derive(Parser, Debug)]
#[command(name = "issuer")]
#[command(about = "Issue download codes and manage the album on a download-code gateway")]
struct Args {
    /// Gateway origin, e.g. https://album.example.cz (default: $SITE_URL, then $URL)
    #[arg(long, global = true)]
    site_url: Option<String>,

    /// Admin secret (default: $ADMIN_SECRET)
    #[arg(long, global = true)]
    secret: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Issue a batch of codes and append their URLs to the URL file
    Generate {
        #[arg(allow_negative_numbers = true)]
        count: Option<i64>,

        #[arg(allow_negative_numbers = true)]
        max_downloads: Option<i64>,

        #[arg(long, default_value = "urls.json")]
        out: PathBuf,

        #[arg(long, default_value = "urls-new.json")]
        new_out: PathBuf,
    },
    /// Publish the album archive
    Upload { file: PathBuf },
    /// List codes with no downloads left
    Exhausted,
    /// Show a code's remaining downloads
    Status { token: String },
    /// Render a QR image for every URL in a URL file
    Qr {
        #[arg(default_value = "urls.json")]
        input: PathBuf,

        #[arg(default_value = "qr-codes")]
        out_dir: PathBuf,
    },
}

/// Zero and missing both mean "use the default", then the gateway's bounds apply.
fn batch_args(count: Option<i64>, max_downloads: Option<i64>) -> (u32, u32) {
    let count = count.filter(|n| *n != 0).unwrap_or(DEFAULT_COUNT);
    let max = max_downloads
        .filter(|n| *n != 0)
        .unwrap_or(DEFAULT_MAX_DOWNLOADS);
    (dropcode::clamp_batch(count), dropcode::clamp_budget(max))
}

fn resolve(flag: Option<String>, vars: &[&str]) -> Option<String> {
    flag.or_else(|| vars.iter().find_map(|name| std::env::var(name).ok()))
        .filter(|s| !s.is_empty())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "issuer=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let configured_site = resolve(args.site_url, &["SITE_URL", "URL"]);
    let site_url = || {
        configured_site.as_deref().ok_or_else(|| {
            anyhow!("Set SITE_URL (e.g. https://album.example.cz) or pass --site-url")
        })
    };
    let secret = resolve(args.secret, &["ADMIN_SECRET"]);
    let admin = || -> Result<AdminClient> {
        let site_url = site_url()?;
        let Some(secret) = secret.as_deref() else {
            bail!("Set ADMIN_SECRET (same value as the gateway) or pass --secret");
        };
        Ok(AdminClient::new(site_url, secret)?)
    };

    match args.command {
        Command::Generate {
            count,
            max_downloads,
            out,
            new_out,
        } => {
            let (count, max_downloads) = batch_args(count, max_downloads);
            generate(&admin()?, count, max_downloads, &out, &new_out).await
        }
        Command::Upload { file } => upload(&admin()?, &file).await,
        Command::Exhausted => exhausted(&admin()?).await,
        Command::Status { token } => status(&AdminClient::new(site_url()?, "")?, &token).await,
        Command::Qr { input, out_dir } => render_qr(&input, &out_dir).await,
    }
}

async fn generate(
    client: &AdminClient,
    count: u32,
    max_downloads: u32,
    out: &Path,
    new_out: &Path,
) -> Result<()> {
    println!(
        "Calling {} (count={}, maxDownloads={})...",
        client.url("/api/admin/generate"),
        count,
        max_downloads
    );

    let generated = client.generate(count, max_downloads).await?;
    println!("Created {} code(s).", generated.tokens.len());

    let total = urls::save(
        out,
        new_out,
        &generated.urls,
        generated.count,
        generated.max_downloads,
    )
    .await?;
    println!("Saved {} total URL(s) to {}", total, out.display());
    println!("New URLs only saved to {}", new_out.display());
    Ok(())
}

async fn upload(client: &AdminClient, file: &Path) -> Result<()> {
    println!("Uploading {}...", file.display());
    let uploaded = client.upload(file).await?;
    println!("{}", uploaded.message);
    println!("  Size:   {} bytes", uploaded.size);
    println!("  SHA256: {}", uploaded.sha256);
    Ok(())
}

async fn exhausted(client: &AdminClient) -> Result<()> {
    let report = client.exhausted().await?;
    println!("{} exhausted code(s)", report.count);
    for entry in &report.exhausted {
        println!(
            "  {}  max={}  at {}",
            entry.token,
            entry.max,
            entry.exhausted_at.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn status(client: &AdminClient, token: &str) -> Result<()> {
    let status = client.status(token).await?;
    println!("  Code:      {}...", dropcode::token::short(token));
    println!("  Remaining: {} of {}", status.remaining, status.max);
    if let Some(at) = &status.exhausted_at {
        println!("  Exhausted: {}", at);
    }
    println!("  {}", status.message);
    Ok(())
}

async fn render_qr(input: &Path, out_dir: &Path) -> Result<()> {
    let raw = tokio::fs::read_to_string(input)
        .await
        .with_context(|| format!("Could not read {}", input.display()))?;
    let urls = urls::previous_urls(&raw);
    if urls.is_empty() {
        bail!(
            "No URLs found in {} (expected an array or {{\"urls\": [...]}})",
            input.display()
        );
    }

    let out = out_dir.to_path_buf();
    let written = tokio::task::spawn_blocking(move || qr::write_all(&urls, &out)).await??;
    println!("Done. {} QR code(s) written to {}", written, out_dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_batch_args_defaults_and_bounds() {
        assert_eq!(batch_args(None, None), (10, 3));
        assert_eq!(batch_args(Some(0), Some(0)), (10, 3));
        assert_eq!(batch_args(Some(-5), Some(-1)), (1, 1));
        assert_eq!(batch_args(Some(99_999), Some(500)), (5000, 100));
        assert_eq!(batch_args(Some(25), Some(7)), (25, 7));
    }

    #[test]
    fn test_qr_parsing_defaults() {
        let args = Args::try_parse_from(["issuer", "qr"]).unwrap();
        match args.command {
            Command::Qr { input, out_dir } => {
                assert_eq!(input, PathBuf::from("urls.json"));
                assert_eq!(out_dir, PathBuf::from("qr-codes"));
            }
            other => panic!("unexpected command {:?}", other),
        }

        let args = Args::try_parse_from(["issuer", "qr", "urls-new.json", "qr-new"]).unwrap();
        assert!(matches!(
            args.command,
            Command::Qr { ref input, ref out_dir }
                if input == &PathBuf::from("urls-new.json") && out_dir == &PathBuf::from("qr-new")
        ));
    }

    #[tokio::test]
    async fn test_render_qr_from_url_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("urls.json");
        let out = dir.path().join("codes");
        tokio::fs::write(
            &input,
            r#"{"urls":["https://x/download/a","https://x/download/b","https://x/download/c"],"lastGenerated":3}"#,
        )
        .await
        .unwrap();

        render_qr(&input, &out).await.unwrap();
        for name in ["qr-1.png", "qr-2.png", "qr-3.png"] {
            assert!(out.join(name).exists(), "missing {}", name);
        }

        let empty = dir.path().join("empty.json");
        tokio::fs::write(&empty, "[]").await.unwrap();
        assert!(render_qr(&empty, &out).await.is_err());
    }

    #[test]
    fn test_generate_parsing() {
        let args = Args::try_parse_from(["issuer", "generate", "50", "2", "--out", "a.json"]).unwrap();
        match args.command {
            Command::Generate {
                count,
                max_downloads,
                out,
                new_out,
            } => {
                assert_eq!(count, Some(50));
                assert_eq!(max_downloads, Some(2));
                assert_eq!(out, PathBuf::from("a.json"));
                assert_eq!(new_out, PathBuf::from("urls-new.json"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
