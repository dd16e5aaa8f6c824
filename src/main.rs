//! 安全监控服务主入口

use secrecy::ExposeSecret;
use security_monitor::{
    config::AppConfig,
    db,
    handlers::health,
    middleware::AppState,
    realtime::EventBus,
    repository::{PgAlertRepository, PgIncidentRepository},
    routes,
    store::RedisStore,
    telemetry,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "--version" => {
                println!("security-monitor {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" => {
                print_help();
                return Ok(());
            }
            _ => {
                eprintln!("未知参数: {}", args[1]);
                print_help();
                std::process::exit(1);
            }
        }
    }

    // 按优先级加载：.env.local > .env
    // 生产环境应该直接设置环境变量，不依赖 .env 文件
    dotenv::from_filename(".env.local").ok();
    dotenv::dotenv().ok();

    health::set_start_time();

    // 1. 加载配置
    let config = AppConfig::from_env().map_err(|e| {
        eprintln!("Configuration error: {}", e);
        anyhow::anyhow!("Failed to load configuration: {}", e)
    })?;

    // 2. 初始化日志与指标
    telemetry::init_telemetry(&config);
    telemetry::init_metrics();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Security monitor starting...");

    // 3. 数据库连接池 + 迁移
    let db_pool = db::create_pool(&config.database).await?;
    db::run_migrations(&db_pool).await?;
    db::record_pool_metrics(&db_pool);

    tracing::info!("Database initialized");

    // 4. 计数器存储
    let store = Arc::new(
        RedisStore::connect(config.redis.url.expose_secret(), config.redis.key_prefix.clone())
            .await?,
    );

    // 5. 构建应用状态
    let event_bus = Arc::new(EventBus::new(1024));
    let app_state = Arc::new(AppState::new(
        config.clone(),
        db_pool.clone(),
        store,
        Arc::new(PgAlertRepository::new(db_pool.clone())),
        Arc::new(PgIncidentRepository::new(db_pool.clone())),
        event_bus.clone(),
    ));

    let event_log_handle = spawn_event_log(&event_bus);

    // 6. 构建路由
    let app = routes::create_router(app_state);

    // 7. 启动服务器
    let addr = &config.server.addr;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(addr = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.server.graceful_shutdown_timeout_secs))
        .await?;

    event_log_handle.abort();
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// 出站安全事件审计日志
///
/// 外部协作方（锁号、通知、值班）各自订阅事件总线，这里只做留痕。
fn spawn_event_log(event_bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    tracing::info!(
                        event_type = event.event_type(),
                        user_id = %event.user_id(),
                        payload = %event.to_payload(),
                        "Security event"
                    );
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Security event log lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// 优雅关闭信号处理
async fn shutdown_signal(timeout_secs: u64) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Ctrl+C received, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Terminate signal received, starting graceful shutdown");
        },
    }

    // 超时后强制关闭
    tokio::spawn(async move {
        tokio::time::sleep(tokio::time::Duration::from_secs(timeout_secs)).await;
        tracing::warn!("Graceful shutdown timeout reached, forcing exit");
        std::process::exit(1);
    });
}

/// 打印帮助信息
fn print_help() {
    println!("security-monitor {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("用法: security-monitor [选项]");
    println!();
    println!("选项:");
    println!("  --version     打印版本信息并退出");
    println!("  --help        打印此帮助信息并退出");
    println!();
    println!("环境变量:");
    println!("  所有配置通过 SECMON_ 前缀的环境变量完成，例如:");
    println!("  SECMON_DATABASE__URL, SECMON_REDIS__URL, SECMON_SECURITY__ADMIN_API_KEY");
}
