use crate::config::WeChatConfig;
use crate::errors::ApiError;
use serde::Deserialize;
use tokio::sync::Mutex;

/// Refresh the cached access token this long before its declared expiry.
const TOKEN_SAFETY_MARGIN_MS: i64 = 30_000;

const API_BASE: &str = "https://api.weixin.qq.com";

#[derive(Debug, Clone)]
pub struct CodeSession {
    pub openid: String,
    pub session_key: String,
    pub unionid: Option<String>,
}

struct CachedToken {
    value: String,
    expires_at_ms: i64,
}

/// Thin client over the WeChat OpenAPI: access-token fetch (cached
/// in-process, refresh serialized by the mutex), `jscode2session`, and
/// subscribe-message send. The server never persists the access token.
pub struct WeChatClient {
    cfg: WeChatConfig,
    http: reqwest::Client,
    token_cache: Mutex<Option<CachedToken>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<i64>,
    errcode: Option<i64>,
    errmsg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CodeSessionResponse {
    openid: Option<String>,
    session_key: Option<String>,
    unionid: Option<String>,
    errcode: Option<i64>,
    errmsg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    errcode: Option<i64>,
    errmsg: Option<String>,
}

impl WeChatClient {
    pub fn new(cfg: WeChatConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .expect("Failed to create HTTP client");
        WeChatClient {
            cfg,
            http,
            token_cache: Mutex::new(None),
        }
    }

    pub fn configured(&self) -> bool {
        self.cfg.configured()
    }

    pub fn activity_template(&self) -> Option<(&str, Option<&str>)> {
        self.cfg
            .activity_template_id
            .as_deref()
            .map(|id| (id, self.cfg.activity_page.as_deref()))
    }

    fn credentials(&self) -> Result<(&str, &str), ApiError> {
        match (self.cfg.appid.as_deref(), self.cfg.appsecret.as_deref()) {
            (Some(appid), Some(secret)) => Ok((appid, secret)),
            _ => Err(ApiError::wechat_not_configured()),
        }
    }

    async fn access_token(&self, now_ms: i64) -> Result<String, ApiError> {
        let (appid, secret) = self.credentials()?;
        let mut cache = self.token_cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.expires_at_ms - TOKEN_SAFETY_MARGIN_MS > now_ms {
                return Ok(cached.value.clone());
            }
        }
        let url = format!(
            "{API_BASE}/cgi-bin/token?grant_type=client_credential&appid={appid}&secret={secret}"
        );
        let resp: TokenResponse = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ApiError::wechat_api(e.to_string()))?
            .json()
            .await
            .map_err(|e| ApiError::wechat_api(e.to_string()))?;
        match (resp.access_token, resp.expires_in) {
            (Some(token), Some(expires_in)) => {
                *cache = Some(CachedToken {
                    value: token.clone(),
                    expires_at_ms: now_ms + expires_in * 1000,
                });
                Ok(token)
            }
            _ => Err(ApiError::wechat_api(format!(
                "token fetch failed: {} {}",
                resp.errcode.unwrap_or(-1),
                resp.errmsg.unwrap_or_default()
            ))),
        }
    }

    /// Exchange a mini-program login code for the user's openid/session_key.
    pub async fn code_to_session(&self, js_code: &str) -> Result<CodeSession, ApiError> {
        let (appid, secret) = self.credentials()?;
        let url = format!(
            "{API_BASE}/sns/jscode2session?appid={appid}&secret={secret}&js_code={js_code}&grant_type=authorization_code"
        );
        let resp: CodeSessionResponse = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ApiError::wechat_api(e.to_string()))?
            .json()
            .await
            .map_err(|e| ApiError::wechat_api(e.to_string()))?;
        match (resp.openid, resp.session_key) {
            (Some(openid), Some(session_key)) => Ok(CodeSession {
                openid,
                session_key,
                unionid: resp.unionid,
            }),
            _ => Err(ApiError::wechat_api(format!(
                "jscode2session failed: {} {}",
                resp.errcode.unwrap_or(-1),
                resp.errmsg.unwrap_or_default()
            ))),
        }
    }

    /// Send one subscribe message. `data` is the template's field map.
    pub async fn send_subscribe(
        &self,
        openid: &str,
        template_id: &str,
        page: Option<&str>,
        data: serde_json::Value,
        now_ms: i64,
    ) -> Result<(), ApiError> {
        let token = self.access_token(now_ms).await?;
        let url = format!("{API_BASE}/cgi-bin/message/subscribe/send?access_token={token}");
        let mut body = serde_json::json!({
            "touser": openid,
            "template_id": template_id,
            "data": data,
        });
        if let Some(page) = page {
            body["page"] = serde_json::Value::String(page.to_string());
        }
        let resp: SendResponse = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ApiError::wechat_api(e.to_string()))?
            .json()
            .await
            .map_err(|e| ApiError::wechat_api(e.to_string()))?;
        match resp.errcode.unwrap_or(0) {
            0 => Ok(()),
            code => Err(ApiError::wechat_api(format!(
                "subscribe send failed: {code} {}",
                resp.errmsg.unwrap_or_default()
            ))),
        }
    }
}
