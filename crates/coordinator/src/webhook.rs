use std::time::Duration;

use tracing::{debug, warn};

use conveyor_domain::Job;

/// 作业状态变更的回调通知器
///
/// 通知异步发出，失败只记录日志，不影响状态机推进。
pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    /// 通知作业的全部匹配回调
    pub fn notify(&self, job: &Job) {
        for webhook in &job.webhooks {
            if !webhook.event.is_empty()
                && !webhook.event.eq_ignore_ascii_case(job.state.as_str())
            {
                continue;
            }
            let client = self.client.clone();
            let url = webhook.url.clone();
            let headers = webhook.headers.clone();
            let payload = serde_json::json!({
                "id": job.id,
                "name": job.name,
                "state": job.state,
                "error": job.error,
            });
            tokio::spawn(async move {
                let mut request = client.post(&url).json(&payload);
                for (key, value) in &headers {
                    request = request.header(key, value);
                }
                match request.send().await {
                    Ok(response) if response.status().is_success() => {
                        debug!("Webhook {} 通知成功", url);
                    }
                    Ok(response) => {
                        warn!("Webhook {} 返回状态 {}", url, response.status());
                    }
                    Err(e) => {
                        warn!("Webhook {} 通知失败: {}", url, e);
                    }
                }
            });
        }
    }
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new()
    }
}
