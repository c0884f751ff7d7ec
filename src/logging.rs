use crate::config::Environment;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter directives when `RUST_LOG` is unset.
pub fn default_directives(env: &Environment) -> &'static str {
    match env {
        // sqlx logs every statement at info, keep it quiet outside of dev
        Environment::Dev => "precon_backend=debug,tower_http=debug,sqlx=info,info",
        Environment::Staging => "precon_backend=debug,tower_http=info,sqlx=warn,info",
        Environment::Prod => "precon_backend=info,tower_http=info,sqlx=warn,warn",
    }
}

pub fn init_logging(env: &Environment) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_directives(env).into());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(env.is_dev())
        .with_line_number(env.is_dev());

    // Structured JSON for log shipping in prod
    if matches!(env, Environment::Prod) {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.json().with_current_span(true).flatten_event(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.pretty())
            .init();
    }

    tracing::info!(env = ?env, "Logging initialized");
}
