use clap::Parser;
use color_eyre::eyre::{Result, WrapErr, eyre};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

use lsimage::application::ImageContext;
use lsimage::domain::{CacheKey, ImageCacheType};
use lsimage::infrastructure::config::{CacheCommand, Command, FetchArgs};
use lsimage::infrastructure::image::codec;
use lsimage::infrastructure::{CliArgs, ConfigStorage, WebImageConfig};

fn init_logging(config: &WebImageConfig) -> Result<()> {
    let default_level = LevelFilter::from_level(config.log_level.to_tracing_level());
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    if let Some(log_path) = config.effective_log_path() {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let file_layer = fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_names(true);

        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .init();

        info!(path = %log_path.display(), "Logging initialized");
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}

fn load_config(args: &CliArgs) -> Result<WebImageConfig> {
    let storage = ConfigStorage::new()?;
    let mut config = storage.load_config(args.config.as_deref())?;
    config.merge_with_args(args);
    Ok(config)
}

async fn fetch(context: &ImageContext, args: FetchArgs) -> Result<()> {
    let options = args.options(context.config().network.default_options);
    let response = context.manager().load(&args.url, options).await;

    if let Some(error) = response.error {
        return Err(error).wrap_err_with(|| format!("failed to fetch {}", args.url));
    }
    let image = response
        .image
        .ok_or_else(|| eyre!("{} produced no image", args.url))?;

    println!(
        "{}x{} {} from {} ({} frame{})",
        image.width(),
        image.height(),
        image.format().map_or("unknown", |f| f.extensions_str().first().copied().unwrap_or("?")),
        response.from,
        image.frame_count(),
        if image.frame_count() == 1 { "" } else { "s" },
    );

    if let Some(output) = args.output {
        let cache = context.cache().clone();
        let key = Url::parse(&args.url).map(|url| context.manager().cache_key_for_url(&url))?;
        let data = tokio::task::spawn_blocking(move || {
            cache.flush();
            cache.get_image_data(&key)
        })
        .await?;
        let data = match data {
            Some(data) => data,
            None => codec::encode(&image)?,
        };
        tokio::fs::write(&output, &data)
            .await
            .wrap_err_with(|| format!("failed to write {}", output.display()))?;
        println!("wrote {} bytes to {}", data.len(), output.display());
    }

    Ok(())
}

async fn cache(context: &ImageContext, command: CacheCommand) -> Result<()> {
    let cache = context.cache().clone();
    match command {
        CacheCommand::Stats => {
            let disk = cache.disk_cache();
            println!("name:   {}", cache.name());
            println!("path:   {}", disk.path().display());
            println!(
                "disk:   {} files, {} / {} bytes",
                disk.total_count(),
                disk.total_size(),
                disk.size_limit()
            );
            println!("memory: {}", cache.memory_cache().stats());
        }
        CacheCommand::Clear { memory, disk } => {
            let tiers = CacheCommand::clear_tiers(memory, disk);
            tokio::task::spawn_blocking(move || cache.clear(tiers)).await?;
            println!("cleared {tiers:?}");
        }
        CacheCommand::Contains { key } => {
            let key = Url::parse(&key).map_or_else(
                |_| CacheKey::new(key.clone()),
                |url| context.manager().cache_key_for_url(&url),
            );
            let found =
                tokio::task::spawn_blocking(move || cache.contains_image(&key, ImageCacheType::ALL))
                    .await?;
            println!("{}", if found { "cached" } else { "not cached" });
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = CliArgs::parse();
    let config = load_config(&args)?;

    init_logging(&config)?;

    info!(version = lsimage::VERSION, "Starting lsimage");

    let context = ImageContext::from_config(config)?;

    match args.command {
        Command::Fetch(fetch_args) => fetch(&context, fetch_args).await,
        Command::Cache(command) => cache(&context, command).await,
    }
}
