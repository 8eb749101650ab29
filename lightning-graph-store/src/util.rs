use std::env;
use std::str::FromStr;

use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;
use time::{macros::format_description, OffsetDateTime};

// UTC, since the local offset cannot be determined soundly in a
// multi-threaded process
fn tstamp() -> String {
    OffsetDateTime::now_utc()
        .format(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
        ))
        .unwrap_or_default()
}

/// Log to stdout, at `RUST_LOG` if set, else at `level_arg`
pub fn setup_logging(who: &str, level_arg: &str) -> Result<(), log::SetLoggerError> {
    let colors = ColoredLevelConfig::new().info(Color::Green).error(Color::Red).warn(Color::Yellow);
    let level = env::var("RUST_LOG").unwrap_or(level_arg.to_string());
    let who = who.to_string();
    fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{} {}/{} {}] {}",
                tstamp(),
                who,
                record.target(),
                colors.color(record.level()),
                message
            ))
        })
        .level(LevelFilter::from_str(&level).unwrap_or(LevelFilter::Info))
        .level_for("redb", LevelFilter::Info)
        .level_for("tokio_postgres", LevelFilter::Info)
        .chain(std::io::stdout())
        .apply()
}
