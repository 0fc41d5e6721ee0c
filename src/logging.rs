use clap_verbosity_flag::{InfoLevel, Verbosity};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub static LOG_ENV_VAR: &str = "FEEDBACK_THEMES_LOG";

/// Install the global subscriber. `FEEDBACK_THEMES_LOG` overrides the level picked by `-v`/`-q`.
pub fn setup_logger(verbosity: &Verbosity<InfoLevel>, ansi: bool) {
    let indicatif_layer = IndicatifLayer::new();

    let default_level: LevelFilter = verbosity.tracing_level_filter();
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .with_env_var(LOG_ENV_VAR)
        .from_env_lossy();

    let fmt = fmt::layer()
        .with_ansi(ansi)
        .with_target(cfg!(debug_assertions))
        .with_file(cfg!(debug_assertions))
        .with_line_number(cfg!(debug_assertions))
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_writer(indicatif_layer.get_stderr_writer())
        .compact();

    tracing_subscriber::registry()
        .with(fmt)
        .with(indicatif_layer)
        .with(env_filter)
        .init();
}
