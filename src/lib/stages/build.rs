use std::fs;

use anyhow::Result;
use chrono::Utc;
use log::info;

use crate::conf::BuildConfig;
use crate::error::CiError;
use crate::stages::{Resource, RunContext};
use crate::utils::docker::{build_image, save_compressed, BuildSpec};
use crate::utils::git::short_head;


/// `<image>.tar.gz`, with path separators flattened
pub fn archive_name(image: &str) -> String {
    format!("{}.tar.gz", image.replace('/', "_"))
}

pub(crate) fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["K", "M", "G", "T"];
    if bytes < 1024 {
        return format!("{}B", bytes);
    }
    let mut size = bytes as f64 / 1024.0;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.1}{}", size, UNITS[unit])
}

/// Fails if `value` still holds an unexpanded `$VAR`
pub(crate) fn resolved(field: &str, value: String) -> Result<String> {
    if value.is_empty() || value.contains('$') {
        return Err(CiError::InvalidConfig(format!("{} is not set (got \"{}\")", field, value)).into());
    }
    Ok(value)
}

/// Tags the image with the short hash of HEAD, then exports it as a gzipped tarball.
/// Sets `IMAGE_TAG`, `CACHEBUST` and `IMAGE_ARCHIVE` for the stages after it.
pub fn run(c: &BuildConfig, ctx: &mut RunContext) -> Result<()> {
    let image = resolved("image", ctx.expand(&c.image))?;
    let tag = short_head(&ctx.runner, &ctx.env, &ctx.workdir)?;
    let cache_bust = Utc::now().timestamp().to_string();
    ctx.set_var("IMAGE_TAG", &tag);
    ctx.set_var("CACHEBUST", &cache_bust);

    let mut build_args = vec![("CACHEBUST".to_string(), cache_bust)];
    let mut extra: Vec<(String, String)> = c
        .build_args
        .iter()
        .map(|(k, v)| (k.clone(), ctx.expand(v)))
        .collect();
    extra.sort();
    build_args.extend(extra);
    let mut tags = vec![format!("{}:{}", image, tag)];
    if c.latest {
        tags.push(format!("{}:latest", image));
    }
    let spec = BuildSpec {
        dockerfile: c.dockerfile.as_ref().map(|f| ctx.expand(f)),
        context: ctx.expand(&c.context),
        tags,
        build_args,
        no_cache: c.no_cache,
    };
    info!("Building Docker image with tag: {}...", tag);
    build_image(&ctx.runner, &spec, &ctx.env, &ctx.workdir)?;

    let archive = match &c.archive {
        Some(a) => ctx.expand(a),
        None => archive_name(&image),
    };
    let archive_path = ctx.workdir.join(&archive);
    ctx.register(Resource::File(archive_path.clone()));
    info!("Saving and compressing Docker image...");
    save_compressed(
        &ctx.runner,
        &format!("{}:{}", image, tag),
        &archive,
        &ctx.env,
        &ctx.workdir,
    )?;
    if let Ok(meta) = fs::metadata(&archive_path) {
        let size = human_size(meta.len());
        info!("Compressed image size: {}", size);
        ctx.runner.note(&format!("{}: {}", archive, size));
    }
    ctx.set_var("IMAGE_ARCHIVE", &archive);
    Ok(())
}
