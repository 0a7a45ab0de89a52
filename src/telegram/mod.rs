//! Telegram 接入：teloxide 分发器、端点与出口

pub mod egress;
pub mod handlers;

use std::sync::Arc;

use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use tokio_util::sync::CancellationToken;

pub use egress::{inline_keyboard, notification_text, run_notifications, Egress, TelegramEgress};
pub use handlers::{classify_text, AccessList};

use crate::gateway::Hub;

fn schema() -> UpdateHandler<teloxide::RequestError> {
    dptree::entry()
        .branch(Update::filter_callback_query().endpoint(handlers::on_callback))
        .branch(Update::filter_channel_post().endpoint(handlers::on_channel_post))
        .branch(Update::filter_message().endpoint(handlers::on_message))
}

/// 长轮询直到 shutdown 被取消
pub async fn run_bot(
    bot: Bot,
    hub: Arc<Hub>,
    egress: Arc<dyn Egress>,
    access: AccessList,
    shutdown: CancellationToken,
) {
    handlers::register_commands(&bot).await;

    let mut dispatcher = Dispatcher::builder(bot, schema())
        .dependencies(dptree::deps![hub, egress, Arc::new(access)])
        .default_handler(|upd| async move {
            tracing::debug!(update_id = ?upd.id, "Unhandled update");
        })
        .build();

    let token = dispatcher.shutdown_token();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        if let Ok(done) = token.shutdown() {
            done.await;
        }
    });

    tracing::info!("Telegram bot is running...");
    dispatcher.dispatch().await;
    tracing::info!("Telegram bot stopped");
}
