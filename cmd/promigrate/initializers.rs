use tokio_util::sync::CancellationToken;
use tracing::{Level, warn};
use tracing_subscriber::{EnvFilter, Registry, filter::Directive, fmt, layer::SubscriberExt};

use crate::cli::Options;

/// Installs the global subscriber. Logs go to stderr so stdout only carries
/// the report.
pub fn init_tracing(opts: &Options) {
    let log_filter = EnvFilter::builder()
        .with_default_directive(Directive::from(opts.log_level))
        .from_env_lossy();

    let include_target = matches!(opts.log_level, Level::DEBUG | Level::TRACE);
    let fmt_layer = fmt::layer()
        .with_target(include_target)
        .with_writer(std::io::stderr);

    let subscriber = Registry::default().with(log_filter).with(fmt_layer);
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("cannot install tracing subscriber: {err}");
    }
}

/// Cancels `cancel` on the first Ctrl-C. In-flight batches finish or are
/// abandoned by the migrator; nothing else is torn down here.
pub async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("interrupt received, cancelling migration");
        cancel.cancel();
    }
}
