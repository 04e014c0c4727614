use std::{process, sync::Arc, time::Duration};

use feedsync::{
    application::{
        context::{Backend, ContextOptions, FeedContext},
        error::AppError,
        listener::ConnectionState,
    },
    config,
    domain::posts::{Post, PostId},
    infra::{
        error::InfraError,
        http::{self, HttpState},
        http_client::HttpBackend,
        memory::{InMemoryBackend, MemoryBackendOptions},
        telemetry,
    },
};
use feedsync_api_types::SavePostInput;
use tokio::sync::Notify;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Submit(args) => run_submit(settings, args).await,
        config::Command::Watch(args) => run_watch(settings, args).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let backend = InMemoryBackend::new(MemoryBackendOptions::from(&settings.workflow));
    let router = http::build_router(HttpState::new(backend));

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        target = "feedsync::serve",
        addr = %settings.server.addr,
        state_machine = %settings.workflow.state_machine,
        "Listening"
    );

    let shutdown = Arc::new(Notify::new());
    let signal = shutdown.clone();
    let mut server = tokio::spawn(
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { signal.notified().await })
            .into_future(),
    );

    tokio::select! {
        joined = &mut server => return server_result(joined),
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|err| AppError::from(InfraError::from(err)))?;
        }
    }

    info!(target = "feedsync::serve", "Shutting down");
    shutdown.notify_one();

    // Event streams stay open until their clients leave, so draining is bounded.
    match tokio::time::timeout(settings.server.graceful_shutdown, &mut server).await {
        Ok(joined) => server_result(joined),
        Err(_) => {
            warn!(
                target = "feedsync::serve",
                timeout_secs = settings.server.graceful_shutdown.as_secs(),
                "graceful shutdown timed out; aborting open connections"
            );
            server.abort();
            Ok(())
        }
    }
}

fn server_result(
    joined: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<(), AppError> {
    match joined {
        Ok(result) => result.map_err(|err| AppError::from(InfraError::from(err))),
        Err(err) => Err(AppError::unexpected(format!("server task failed: {err}"))),
    }
}

fn client_context(settings: &config::Settings) -> Result<FeedContext, AppError> {
    let backend = HttpBackend::new(&settings.backend)?;
    Ok(FeedContext::new(
        Backend::from_shared(Arc::new(backend)),
        ContextOptions {
            viewer_id: settings.backend.viewer_id.clone(),
            listener: settings.listener.options(),
        },
    ))
}

async fn run_submit(settings: config::Settings, args: config::SubmitArgs) -> Result<(), AppError> {
    let feed_id = args
        .feed
        .clone()
        .unwrap_or_else(|| settings.workflow.default_feed.clone());
    let context = client_context(&settings)?;
    let loaded = context.initialize(&feed_id).await?;
    info!(target = "feedsync::submit", feed_id = %feed_id, loaded, "Feed loaded");

    let submitted = context
        .submit_post(SavePostInput {
            caption: args.caption,
            photo_storage_key: args.photo_key,
            photo_url: args.photo_url,
            feed_id: Some(feed_id.clone()),
        })
        .await?;
    info!(
        target = "feedsync::submit",
        placeholder_id = %submitted.placeholder_id,
        post_id = %submitted.post_id,
        "Submission accepted"
    );

    if args.wait_seconds > 0 {
        let wait = Duration::from_secs(args.wait_seconds);
        match wait_for_decision(&context, &submitted.post_id, wait).await {
            Some(post) => info!(
                target = "feedsync::submit",
                post_id = %post.id,
                status = post.moderation_status.as_str(),
                "Moderation decided"
            ),
            None => warn!(
                target = "feedsync::submit",
                post_id = %submitted.post_id,
                wait_secs = args.wait_seconds,
                "No moderation decision before timeout"
            ),
        }
    }

    for post in context.store().snapshot() {
        println!(
            "{}\t{}\t{}\t{}",
            post.id,
            post.moderation_status.as_str(),
            post.owner,
            post.caption
        );
    }

    context.dispose();
    Ok(())
}

async fn wait_for_decision(
    context: &FeedContext,
    post_id: &PostId,
    wait: Duration,
) -> Option<Post> {
    let mut revisions = context.store().subscribe();
    tokio::time::timeout(wait, async {
        loop {
            if let Some(post) = context.store().get(post_id)
                && post.moderation_status.is_terminal()
            {
                return Some(post);
            }
            if revisions.changed().await.is_err() {
                return None;
            }
        }
    })
    .await
    .ok()
    .flatten()
}

async fn run_watch(settings: config::Settings, args: config::WatchArgs) -> Result<(), AppError> {
    let feed_id = args
        .feed
        .unwrap_or_else(|| settings.workflow.default_feed.clone());
    let context = client_context(&settings)?;
    let loaded = context.initialize(&feed_id).await?;
    info!(target = "feedsync::watch", feed_id = %feed_id, loaded, "Watching feed");

    let mut states = context.listener().watch_state();
    let mut revisions = context.store().subscribe();

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.map_err(|err| AppError::from(InfraError::from(err)))?;
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                info!(target = "feedsync::watch", state = %state, "Connection state changed");
                if state == ConnectionState::Disconnected {
                    warn!(
                        target = "feedsync::watch",
                        last_error = context.listener().last_error().unwrap_or_default(),
                        "Listener gave up"
                    );
                    break;
                }
            }
            changed = revisions.changed() => {
                if changed.is_err() {
                    break;
                }
                let latest = context.listener().recent_events().into_iter().next();
                info!(
                    target = "feedsync::watch",
                    revision = *revisions.borrow_and_update(),
                    posts = context.store().len(),
                    pending = context.store().pending_moderation(),
                    last_event = latest.as_ref().map(|event| event.kind.as_str()).unwrap_or(""),
                    last_post = latest.as_ref().map(|event| event.post_id.as_str()).unwrap_or(""),
                    "Feed updated"
                );
            }
        }
    }

    context.dispose();
    Ok(())
}
