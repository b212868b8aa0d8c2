use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use pairchat_sync::{
    cli::{Cli, Commands},
    config::{self, SyncConfig},
    infra::{
        metrics, MemoryRealtime, MemoryStore, RecordingBadge, RestClient,
    },
    logging,
    model::{MessageBody, MESSAGES_TABLE, NewMessage},
    repository::{MessageRepository, TombstoneRepository},
    service::{MediaUpload, UnreadAggregator},
    sync::{Collaborators, SyncEngine},
};
use std::fs;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // 加载 .env 文件（如果存在）
    let _ = dotenvy::dotenv();

    // 解析命令行参数
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::GenerateConfig { path }) => return generate_config(path),
        Some(Commands::ValidateConfig { path }) => return validate_config(path),
        Some(Commands::ShowConfig) => return show_config(&cli),
        _ => {}
    }

    // 快速读取配置文件的 [logging] 段（不加载完整配置）
    let early_log = config::load_early_logging_config(cli.config_file.as_deref());

    // 合并日志配置（优先级：CLI > 配置文件 > 默认值）
    let log_level = cli
        .get_log_level()
        .or(early_log.level)
        .unwrap_or_else(|| "info".to_string());
    let log_format = cli.get_log_format().or(early_log.format);
    let log_file = cli.log_file.clone().or(early_log.file);

    let _log_guard =
        logging::init_logging(&log_level, log_format.as_deref(), log_file.as_deref(), cli.quiet)?;

    if cli.enable_metrics {
        metrics::init().map_err(|e| anyhow!("指标初始化失败: {}", e))?;
        tracing::info!("📊 Prometheus recorder installed");
    }

    let config = SyncConfig::load(&cli).context("加载配置失败")?;
    if cli.dev {
        tracing::info!("🔧 开发模式已启用");
    }

    match &cli.command {
        Some(Commands::Unread { viewer, access_token }) => {
            run_unread(&config, viewer, access_token.as_deref()).await?
        }
        _ => run_demo(config).await?,
    }

    if let Some(rendered) = metrics::render_metrics() {
        println!("\n# metrics\n{}", rendered);
    }
    Ok(())
}

/// 通过 REST 后端重新计算未读数
async fn run_unread(config: &SyncConfig, viewer: &str, access_token: Option<&str>) -> Result<()> {
    let mut client = RestClient::new(&config.backend)?;
    if let Some(token) = access_token {
        client = client.with_access_token(token);
    }
    let client = Arc::new(client);
    let aggregator = UnreadAggregator::new(
        viewer,
        MessageRepository::new(client.clone()),
        TombstoneRepository::new(client),
        config.sync.unread_dedup_capacity,
    );

    let count = aggregator
        .fetch_unread_count()
        .await
        .with_context(|| format!("查询 {} 的未读数失败", viewer))?;
    println!("📬 {} has {} unread message(s)", viewer, count);
    Ok(())
}

/// 进程内演示：alice 与 bob 在同一个内存后端上对话
async fn run_demo(config: SyncConfig) -> Result<()> {
    let realtime = Arc::new(MemoryRealtime::new());
    let store = Arc::new(MemoryStore::with_realtime(realtime.clone()));
    let badge = Arc::new(RecordingBadge::new(true));
    seed_demo_history(&store)?;

    let collaborators = Collaborators {
        query: store.clone(),
        realtime: realtime.clone(),
        media: store.clone(),
        badge: badge.clone(),
    };
    let alice = SyncEngine::new(config.clone(), "alice", collaborators.clone());
    let bob = SyncEngine::new(config, "bob", collaborators);

    alice.start().await?;
    bob.start().await?;
    println!("📬 alice starts with {} unread", alice.unread_summary().unread_count);

    let conversation = alice.focus_conversation("c-demo", "bob").await?;
    println!(
        "👀 alice opened c-demo ({} messages), unread now {}",
        conversation.messages().len(),
        alice.unread_summary().unread_count
    );

    let bob_view = bob.focus_conversation("c-demo", "alice").await?;
    if let Some(typing) = bob.typing("c-demo") {
        typing.send_typing_event().await?;
    }
    settle().await;
    let partner_typing = alice.typing("c-demo").map(|t| t.partner_typing()).unwrap_or(false);
    println!("⌨️ alice sees bob typing: {}", partner_typing);

    bob_view.send_text("see you at eight").await?;
    bob.send_media(MediaUpload {
        conversation_id: "c-demo".to_string(),
        author_id: "bob".to_string(),
        recipient_id: "alice".to_string(),
        bytes: Bytes::from_static(b"\x89PNG\r\n\x1a\n"),
        content_type: "image/png".to_string(),
        file_name: Some("sunset.png".to_string()),
        expires_at: None,
    })
    .await?;

    // 另一个会话里的新消息计入未读
    let other = NewMessage::text("c-other", "carol", "alice", "are you coming?".to_string());
    MessageRepository::new(store.clone()).insert(&other).await?;
    settle().await;

    if let Some(oldest) = conversation.messages().last().map(|m| m.id.clone()) {
        conversation.delete_for_me(&oldest).await?;
    }
    settle().await;

    println!("\n💬 alice's view of c-demo:");
    for message in conversation.messages() {
        let body = match message.body() {
            MessageBody::Text(text) => text.to_string(),
            MessageBody::Media { path, .. } => format!("<{}>", path),
            MessageBody::Expired => "<expired>".to_string(),
        };
        println!(
            "  {} {:>5}: {:<28} delivered={} read={}",
            message.created_at.format("%H:%M:%S"),
            message.author_id,
            body,
            message.delivered_at.is_some(),
            message.read_at.is_some()
        );
    }
    let summary = alice.unread_summary();
    println!(
        "\n📊 alice unread={} last={:?}",
        summary.unread_count,
        summary.last_message.map(|l| l.preview)
    );
    println!("🔢 badge writes: {:?}", badge.writes());

    alice.shutdown().await?;
    bob.shutdown().await?;
    Ok(())
}

fn seed_demo_history(store: &MemoryStore) -> Result<()> {
    let history = [
        ("bob", "alice", "hey, dinner tonight?"),
        ("alice", "bob", "sure, where?"),
        ("bob", "alice", "the usual place"),
    ];
    for (offset, (author, recipient, body)) in history.into_iter().enumerate() {
        let mut message = NewMessage::text("c-demo", author, recipient, body.to_string());
        message.created_at -= chrono::Duration::minutes(10 - offset as i64);
        store.seed(MESSAGES_TABLE, serde_json::to_value(&message)?);
    }
    Ok(())
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// 生成默认配置文件
fn generate_config(path: &str) -> Result<()> {
    let default_config = r#"# pairchat-sync 配置文件
# 此文件由 pairchat-sync generate-config 生成

[backend]
url = "https://your-project.example.co"
api_key = ""
media_bucket = "chat-media"
request_timeout_secs = 15

[sync]
history_page_size = 200
max_buffered_events = 1000
unread_dedup_capacity = 10000

[typing]
timeout_ms = 3000

[media]
max_upload_bytes = 26214400

[logging]
level = "info"
format = "compact"
# file = "./logs/pairchat.log"
"#;

    fs::write(path, default_config).with_context(|| format!("无法写入配置文件: {}", path))?;

    println!("✅ 配置文件已生成: {}", path);
    Ok(())
}

/// 验证配置文件
fn validate_config(path: &str) -> Result<()> {
    let config = SyncConfig::from_toml_file(path)
        .with_context(|| format!("配置文件验证失败: {}", path))?;
    config
        .validate()
        .with_context(|| format!("配置取值无效: {}", path))?;

    println!("✅ 配置文件有效: {}", path);
    println!("📊 配置摘要:");
    println!("  - Backend: {}", config.backend.url);
    println!("  - Media Bucket: {}", config.backend.media_bucket);
    println!("  - History Page Size: {}", config.sync.history_page_size);
    println!("  - Typing Timeout: {}ms", config.typing.timeout_ms);

    Ok(())
}

/// 显示最终配置（合并后的配置）
fn show_config(cli: &Cli) -> Result<()> {
    // 初始化基本日志（用于显示配置）
    let _guard = logging::init_logging("info", None, None, false)?;

    let config = SyncConfig::load(cli).context("加载配置失败")?;

    println!("📊 最终配置（合并后的配置）:");
    println!("{}", serde_json::to_string_pretty(&config)?);

    Ok(())
}
