use std::{path::PathBuf, sync::Arc};

use anyhow::Context as _;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use dotenvy::dotenv;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{trace::Tracer, Resource};
use probot::{command, ConfigFile, Decoder, PlaybackSessions, Player, Settings};
use serenity::{
    async_trait,
    client::{Client, Context, EventHandler},
    model::{gateway::Ready, voice::VoiceState},
    prelude::GatewayIntents,
};
use songbird::SerenityInit;
use tracing::{info, warn};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

struct Handler;

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _: Context, ready: Ready) {
        info!(
            guilds = ready.guilds.len(),
            "{} is connected!", ready.user.name
        );
    }

    async fn voice_state_update(&self, ctx: Context, _old: Option<VoiceState>, new: VoiceState) {
        if let Some(guild_id) = new.guild_id {
            if let Err(e) = command::stop_if_disconnected(&ctx, guild_id, &new).await {
                warn!("Error while handling a voice state update: {e:?}");
            }
        }
    }
}

fn init_tracer(otlp_endpoint: String) -> anyhow::Result<Tracer> {
    let otlp_exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(otlp_endpoint);
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(otlp_exporter)
        .with_trace_config(
            opentelemetry_sdk::trace::config().with_resource(Resource::new(vec![KeyValue::new(
                opentelemetry_semantic_conventions::resource::SERVICE_NAME,
                "probot",
            )])),
        )
        .install_simple()
        .context("Failed to install opentelemetry pipeline")
}

fn init_tracing_subscriber(
    verbose: &Verbosity<InfoLevel>,
    otlp_endpoint: Option<String>,
) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = verbose
            .log_level()
            .map_or_else(|| "off".to_owned(), |l| l.as_str().to_lowercase());
        EnvFilter::new(format!("warn,probot={level}"))
    });
    let otel = otlp_endpoint
        .map(init_tracer)
        .transpose()?
        .map(OpenTelemetryLayer::new);

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .with(otel)
        .init();
    Ok(())
}

#[derive(Parser)]
#[clap(version, about)]
struct Opt {
    /// Overrides `prefix` in the config file.
    #[clap(long, env)]
    command_prefix: Option<String>,

    /// Overrides `token` in the config file.
    #[clap(long, env)]
    discord_token: Option<String>,

    #[clap(long, env, value_parser, default_value = "config.json")]
    config_file: PathBuf,

    /// Program used to decode audio files.
    #[clap(long, env, value_parser, default_value = probot::decoder::DEFAULT_DECODER)]
    ffmpeg: PathBuf,

    /// Stops any single playback after this long, e.g. "10m".
    #[clap(long, env)]
    max_playback_duration: Option<humantime::Duration>,

    #[clap(long, env)]
    otlp_endpoint: Option<String>,

    #[clap(flatten)]
    verbose: Verbosity<InfoLevel>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let opt = Opt::parse();

    init_tracing_subscriber(&opt.verbose, opt.otlp_endpoint)?;

    let settings = Settings::resolve(
        opt.discord_token,
        opt.command_prefix,
        opt.ffmpeg,
        opt.max_playback_duration.map(Into::into),
        ConfigFile::load_or_default(&opt.config_file)?,
    )?;
    info!(prefix = %settings.prefix, decoder = ?settings.decoder, "starting");

    let framework = poise::Framework::builder()
        .setup(|_, _, _: &poise::Framework<(), anyhow::Error>| Box::pin(async move { Ok(()) }))
        .options(poise::FrameworkOptions {
            prefix_options: poise::PrefixFrameworkOptions {
                prefix: Some(settings.prefix.clone()),
                mention_as_prefix: true,
                ..Default::default()
            },
            commands: command::commands(),
            post_command: |ctx| {
                Box::pin(async move {
                    info!(
                        command = %ctx.command().qualified_name,
                        author = %ctx.author().name,
                        "executed command"
                    );
                })
            },
            on_error: |error| {
                Box::pin(async move {
                    if let poise::FrameworkError::Command { error, ctx, .. } = &error {
                        warn!(
                            command = %ctx.command().qualified_name,
                            "Error while running a command: {error:?}"
                        );
                    }
                    if let Err(e) = poise::builtins::on_error(error).await {
                        warn!("Error while handling an error: {e:?}");
                    }
                })
            },
            ..Default::default()
        })
        .build();

    let intents = GatewayIntents::non_privileged() | GatewayIntents::MESSAGE_CONTENT;

    let mut client = Client::builder(&settings.token, intents)
        .event_handler(Handler)
        .framework(framework)
        .register_songbird()
        .await
        .context("Error while creating client")?;

    {
        let mut data = client.data.write().await;

        data.insert::<Player>(Arc::new(Player::new(Decoder::new(settings.decoder.clone()))));
        data.insert::<PlaybackSessions>(Arc::new(PlaybackSessions::new()));
        data.insert::<Settings>(Arc::new(settings));
    }

    let shard_manager = client.shard_manager.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {e:?}");
            return;
        }
        info!("shutting down");
        shard_manager.shutdown_all().await;
    });

    if let Err(why) = client.start().await {
        warn!("Client ended: {why:?}");
    }

    Ok(())
}
