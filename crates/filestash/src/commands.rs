use std::io::Write;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use console::style;
use filestash_service::caching::{Codec, FileCache, JsonCodec, YamlCodec};
use filestash_service::config::{CodecKind, Config};

use crate::cli::Command;

/// Runs `command` against the cache configured in `config`, writing its output to `out`.
pub async fn run(config: &Config, command: Command, out: &mut impl Write) -> Result<()> {
    let cache_config = config.file_cache();
    match config.codec {
        CodecKind::Json => run_with(&FileCache::new(&cache_config, JsonCodec), command, out).await,
        CodecKind::Yaml => run_with(&FileCache::new(&cache_config, YamlCodec), command, out).await,
    }
}

async fn run_with<C: Codec>(
    cache: &FileCache<C>,
    command: Command,
    out: &mut impl Write,
) -> Result<()> {
    if let Command::Path { key } = command {
        writeln!(out, "{}", cache.file_path(&key).display())?;
        return Ok(());
    }

    if !cache.is_available().await {
        anyhow::bail!(
            "cache manifest at {} can not be loaded",
            cache.manifest().path().display()
        );
    }

    let result = match command {
        Command::Cleanup { dry_run: true } => dry_run(cache, out).await,
        Command::Cleanup { dry_run: false } => cleanup(cache, out).await,
        Command::List => list(cache, out).await,
        Command::Evict { keys } => evict(cache, &keys, out).await,
        Command::Path { .. } => Ok(()),
    };

    cache
        .shutdown()
        .await
        .context("failed to persist cache manifest")?;
    result
}

async fn dry_run<C: Codec>(cache: &FileCache<C>, out: &mut impl Write) -> Result<()> {
    let expired = cache.expired_keys_at(Utc::now()).await?;
    for key in &expired {
        writeln!(out, "would remove {key}")?;
    }
    writeln!(out, "{} expired entries", expired.len())?;
    Ok(())
}

async fn cleanup<C: Codec>(cache: &FileCache<C>, out: &mut impl Write) -> Result<()> {
    let stats = cache.cleanup().await.context("failed to clean up cache")?;
    writeln!(
        out,
        "removed {} entries, retained {}",
        stats.removed, stats.retained
    )?;

    for (key, error) in &stats.failures {
        writeln!(out, "{} {key}: {error}", style("failed").red())?;
    }
    if !stats.is_success() {
        anyhow::bail!("failed to remove {} cache files", stats.failures.len());
    }
    Ok(())
}

async fn list<C: Codec>(cache: &FileCache<C>, out: &mut impl Write) -> Result<()> {
    let now = Utc::now();
    for (key, entry) in cache.entries().await? {
        let expires = match entry.expires_at() {
            Some(at) => at.to_rfc3339_opts(SecondsFormat::Secs, true),
            None => "never".to_owned(),
        };
        let status = if entry.is_expired_at(now) {
            style("expired").red()
        } else {
            style("fresh").green()
        };
        writeln!(out, "{key}\t{}\t{expires}\t{status}", entry.file_name)?;
    }
    Ok(())
}

async fn evict<C: Codec>(cache: &FileCache<C>, keys: &[String], out: &mut impl Write) -> Result<()> {
    for key in keys {
        let evicted = cache
            .evict(key)
            .await
            .with_context(|| format!("failed to evict `{key}`"))?;
        if evicted {
            writeln!(out, "evicted {key}")?;
        } else {
            writeln!(out, "{key} is not cached")?;
        }
    }
    Ok(())
}
