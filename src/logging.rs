use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,reqwest=warn,teloxide=info";

/// Инициализирует tracing: фильтр из `RUST_LOG`, затем `LOG_LEVEL`, иначе значение по умолчанию.
/// `LOG_FORMAT=json` включает JSON-вывод.
pub fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            std::env::var("LOG_LEVEL")
                .map_err(|e| e.to_string())
                .and_then(|lvl| EnvFilter::try_new(lvl.to_lowercase()).map_err(|e| e.to_string()))
        })
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().with_env_filter(env_filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).compact().init();
    }
}

pub fn compact(value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        value.to_string()
    } else {
        let mut s = value.chars().take(max).collect::<String>();
        s.push_str("...");
        s
    }
}
