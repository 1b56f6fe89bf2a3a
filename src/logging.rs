use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static LOGGING: OnceCell<()> = OnceCell::new();

/// 安装全局 tracing subscriber；`RUST_LOG` 优先于传入的默认过滤规则。
/// 重复调用是空操作，宿主进程已有 subscriber 时也不会报错。
pub fn init(default_filter: &str) {
    LOGGING.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter));
        if let Err(err) = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
        {
            eprintln!("[nextsync] tracing subscriber already installed: {err}");
        }
    });
}
