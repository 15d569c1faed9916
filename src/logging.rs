use std::io::Write;

/// Installs the process-wide logger.
///
/// Lines are formatted as `timestamp - level - message`. `RUST_LOG`, when set,
/// overrides `level`. Fails if a logger was already installed.
pub fn init_logging(level: log::LevelFilter) -> Result<(), log::SetLoggerError> {
    let mut builder = env_logger::Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(None, level);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.try_init()
}
