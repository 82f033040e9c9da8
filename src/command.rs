use std::{sync::Arc, time::Duration};

use anyhow::Context as _;
use serenity::{
    all::{ChannelType, Context as SerenityContext, CreateMessage, GuildChannel, VoiceState},
    model::id::{ChannelId, GuildId},
};
use songbird::{Call, Songbird};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    config::Settings,
    decoder::DecodeRequest,
    play::{PlaybackError, PlaybackReport, Player},
    session::{PlaybackSession, PlaybackSessions},
    transport::SongbirdTransport,
};

type Context<'a> = poise::Context<'a, (), anyhow::Error>;

pub fn commands() -> Vec<poise::Command<(), anyhow::Error>> {
    vec![help(), join(), leave(), ping(), play(), stop()]
}

/// Shows the list of commands.
#[poise::command(prefix_command)]
pub async fn help(
    ctx: Context<'_>,
    #[description = "Specific command to show help about"] command: Option<String>,
) -> anyhow::Result<()> {
    if command.is_some() {
        poise::builtins::help(ctx, command.as_deref(), Default::default()).await?;
        return Ok(());
    }

    let text = help_text(&ctx.framework().options().commands, ctx.prefix());
    let dm = ctx
        .author()
        .dm(&ctx, CreateMessage::new().content(text))
        .await;
    match dm {
        Ok(_) if ctx.guild_id().is_some() => {
            ctx.reply("Sent you a DM with the list of commands.").await?;
        }
        Ok(_) => {}
        Err(e) => {
            warn!("Could not send help by DM: {e:?}");
            poise::builtins::help(ctx, None, Default::default()).await?;
        }
    }
    Ok(())
}

fn help_text(commands: &[poise::Command<(), anyhow::Error>], prefix: &str) -> String {
    let lines = commands
        .iter()
        .filter(|c| !c.hide_in_help)
        .map(|c| {
            let usage = std::iter::once(format!("{prefix}{}", c.name))
                .chain(c.parameters.iter().map(|p| {
                    if p.required {
                        format!("<{}>", p.name)
                    } else {
                        format!("[{}]", p.name)
                    }
                }))
                .collect::<Vec<_>>()
                .join(" ");
            format!("{usage:<20} {}", c.description.as_deref().unwrap_or_default())
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!("```\nCommands:\n{lines}\n```")
}

/// Ping Pong
#[poise::command(prefix_command, guild_only)]
pub async fn ping(ctx: Context<'_>) -> anyhow::Result<()> {
    ctx.channel_id().say(&ctx, "Pong").await?;
    Ok(())
}

async fn songbird_manager(ctx: Context<'_>) -> anyhow::Result<Arc<Songbird>> {
    Ok(songbird::get(ctx.as_ref())
        .await
        .context("Songbird Voice client placed in at initialization.")?
        .clone())
}

async fn sessions(ctx: &SerenityContext) -> anyhow::Result<Arc<PlaybackSessions>> {
    Ok(ctx
        .data
        .read()
        .await
        .get::<PlaybackSessions>()
        .context("Could not get PlaybackSessions")?
        .clone())
}

/// Joins a voice channel.
#[poise::command(prefix_command, guild_only)]
pub async fn join(
    ctx: Context<'_>,
    #[description = "Voice channel to join; defaults to yours"] channel: Option<GuildChannel>,
) -> anyhow::Result<()> {
    let guild_id = ctx.guild_id().context("Guild was not found")?;
    let manager = songbird_manager(ctx).await?;

    if let Some(call) = manager.get(guild_id) {
        if call.lock().await.current_connection().is_some() {
            ctx.reply("Already connected in this server.").await?;
            return Ok(());
        }
    }

    let target = match channel {
        Some(channel) => Some((channel.id, channel.name, channel.kind)),
        None => {
            let guild = ctx.guild().context("Guild was not found")?;
            guild
                .voice_states
                .get(&ctx.author().id)
                .and_then(|voice_state| voice_state.channel_id)
                .map(|id| (id, channel_name(&guild.channels, id), ChannelType::Voice))
        }
    };
    let (channel_id, name, kind) = match target {
        Some(t) => t,
        None => {
            ctx.reply("You are not in a voice channel.").await?;
            return Ok(());
        }
    };
    if !matches!(kind, ChannelType::Voice | ChannelType::Stage) {
        ctx.reply(format!("`{name}` is not a voice channel.")).await?;
        return Ok(());
    }

    match manager.join(guild_id, channel_id).await {
        Ok(_) => {
            sessions(ctx.serenity_context())
                .await?
                .get_or_create(guild_id);
            info!(%guild_id, %channel_id, "joined voice channel");
            ctx.channel_id()
                .say(&ctx, format!("Connected to `{name}`"))
                .await?;
        }
        Err(e) => {
            warn!("Error joining {channel_id}: {e:?}");
            ctx.channel_id()
                .say(&ctx, "Error joining the channel")
                .await?;
        }
    }

    Ok(())
}

fn channel_name(
    channels: &std::collections::HashMap<ChannelId, GuildChannel>,
    id: ChannelId,
) -> String {
    channels
        .get(&id)
        .map_or_else(|| id.to_string(), |c| c.name.clone())
}

/// Leaves a voice channel.
#[poise::command(prefix_command, guild_only)]
pub async fn leave(ctx: Context<'_>) -> anyhow::Result<()> {
    let guild_id = ctx.guild_id().context("Guild was not found")?;
    let manager = songbird_manager(ctx).await?;

    if manager.get(guild_id).is_none() {
        ctx.reply("Not in a voice channel").await?;
        return Ok(());
    }

    sessions(ctx.serenity_context()).await?.remove(&guild_id);
    manager.remove(guild_id).await?;
    ctx.say("Disconnected").await?;

    Ok(())
}

/// Stops the current and queued playback.
#[poise::command(prefix_command, guild_only)]
pub async fn stop(ctx: Context<'_>) -> anyhow::Result<()> {
    let guild_id = ctx.guild_id().context("Guild was not found")?;
    if sessions(ctx.serenity_context()).await?.stop(&guild_id) {
        ctx.say("Stopped").await?;
    } else {
        ctx.reply("Nothing is playing").await?;
    }
    Ok(())
}

/// Plays an audio file.
#[poise::command(prefix_command, guild_only)]
pub async fn play(
    ctx: Context<'_>,
    #[rest]
    #[description = "Full path on disk to the file to play."]
    filename: String,
) -> anyhow::Result<()> {
    let guild_id = ctx.guild_id().context("Guild was not found")?;
    let Some(call) = songbird_manager(ctx).await?.get(guild_id) else {
        ctx.reply("Not in a voice channel").await?;
        return Ok(());
    };

    let (player, settings) = {
        let data = ctx.serenity_context().data.read().await;
        (
            data.get::<Player>().context("Could not get Player")?.clone(),
            data.get::<Settings>().context("Could not get Settings")?.clone(),
        )
    };
    let (session, mut stop) = sessions(ctx.serenity_context()).await?.subscribe(guild_id);

    let request = DecodeRequest::new(filename.trim());
    let name = request.display_name();

    let outcome = tokio::select! {
        res = play_in_call(ctx, &player, &session, request, call, settings.max_playback_duration) => res,
        _ = stop.stopped() => Err(PlaybackError::Cancelled),
    };

    match outcome {
        Ok(report) => {
            ctx.say(format!("Finished playing {}", report.summary()))
                .await?;
        }
        Err(PlaybackError::FileNotFound(path)) => {
            ctx.reply(format!("File `{}` does not exist.", path.display()))
                .await?;
        }
        Err(e) => {
            warn!("Error while playing {name}: {e:?}");
            ctx.reply(format!(
                "An exception occurred during playback: `{}: {e}`",
                e.kind()
            ))
            .await?;
        }
    }

    Ok(())
}

async fn play_in_call(
    ctx: Context<'_>,
    player: &Player,
    session: &PlaybackSession,
    request: DecodeRequest,
    call: Arc<Mutex<Call>>,
    limit: Option<Duration>,
) -> Result<PlaybackReport, PlaybackError> {
    let pending = player.prepare(request, session).await?;
    if let Err(e) = ctx
        .say(format!("Playing `{}`", pending.request().display_name()))
        .await
    {
        warn!("Error while sending the start notice: {e:?}");
    }

    let transport = Arc::new(SongbirdTransport::new(call));
    match limit {
        Some(limit) => tokio::time::timeout(limit, pending.run(transport))
            .await
            .unwrap_or(Err(PlaybackError::TimedOut(limit))),
        None => pending.run(transport).await,
    }
}

/// Stops the guild's playback when the bot itself is disconnected from voice.
pub async fn stop_if_disconnected(
    ctx: &SerenityContext,
    guild_id: GuildId,
    state: &VoiceState,
) -> anyhow::Result<()> {
    if state.user_id != ctx.cache.current_user().id || state.channel_id.is_some() {
        return Ok(());
    }

    if sessions(ctx).await?.remove(&guild_id).is_some() {
        info!(%guild_id, "disconnected from voice, playback stopped");
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_help_text_lists_commands() {
        let text = help_text(&commands(), "!");
        assert!(text.starts_with("```\nCommands:\n"));
        assert!(text.contains("!ping"));
        assert!(text.contains("!join [channel]"));
        assert!(text.contains("!play <filename>"));
        assert!(text.contains("Plays an audio file."));
        assert_eq!(text.lines().filter(|l| l.starts_with('!')).count(), 6);
    }
}
