use std::io::Write;

/// 初始化全局日志
///
/// 默认级别为 Info，可以通过 `RUST_LOG` 覆盖。
pub fn init_log() {
    let _ = builder().try_init();
}

/// 测试中使用：重复调用不会 panic，输出交给 test harness 捕获
pub fn init_test_log() {
    let _ = builder().is_test(true).filter(None, log::LevelFilter::Debug).try_init();
}

const DIM: anstyle::Color = anstyle::Color::Rgb(anstyle::RgbColor(110, 110, 110));
const TARGET: anstyle::Color = anstyle::Color::Rgb(anstyle::RgbColor(90, 120, 150));

/// 按级别挑选前景色，Debug 和 Trace 沿用 env_logger 的默认样式
fn level_color(level: log::Level) -> Option<anstyle::Color> {
    let color = match level {
        log::Level::Error => anstyle::AnsiColor::Red,
        log::Level::Warn => anstyle::AnsiColor::Yellow,
        log::Level::Info => anstyle::AnsiColor::Green,
        log::Level::Debug | log::Level::Trace => return None,
    };
    Some(anstyle::Color::Ansi(color))
}

fn builder() -> env_logger::Builder {
    let mut builder = env_logger::Builder::new();
    builder
        .format(|buf, record| {
            let mut level_style = buf.default_level_style(record.level());
            if let Some(color) = level_color(record.level()) {
                level_style = level_style.fg_color(Some(color));
            }
            let dim = anstyle::Style::new().fg_color(Some(DIM));
            let target = anstyle::Style::new().fg_color(Some(TARGET));

            // 只保留文件名，去掉目录
            let file = record.file().and_then(|f| f.rsplit(['\\', '/']).next()).unwrap_or("?");
            let location = match record.line() {
                Some(line) => format!("{file}:{line}"),
                None => file.to_string(),
            };

            writeln!(
                buf,
                "{level_style}{:<5} {}{level_style:#} {dim}{location}{dim:#} {target}{}{target:#} | {}",
                record.level(),
                chrono::Local::now().format("%H:%M:%S%.3f"),
                record.target(),
                record.args()
            )
        })
        .filter(None, log::LevelFilter::Info)
        .parse_default_env();
    builder
}
