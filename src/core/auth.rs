// src/core/auth.rs

//! Client for the remote authentication service.
//!
//! The service verifies credentials and issues tokens. Any failure to reach it
//! is reported as a `ServiceError` result so a broken dependency never tears
//! down the gateway.

use crate::config::AuthConfig;
use crate::core::GatewayError;
use crate::core::protocol::message::{
    Credential, LoginResponse, LoginResult, SignupResponse, SignupResult,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

#[async_trait]
pub trait AuthService: Send + Sync + 'static {
    async fn login(&self, account: &str, credential: &Credential) -> LoginResponse;

    async fn signup(&self, account: &str, password: &str, user_name: &str) -> SignupResponse;

    /// `Ok`, `TokenError` or `ServiceError`.
    async fn check_token(&self, user_id: &str, token: &str) -> LoginResult;
}

#[derive(Serialize)]
struct LoginBody<'a> {
    account: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
}

#[derive(Serialize)]
struct SignupBody<'a> {
    account: &'a str,
    password: &'a str,
    user_name: &'a str,
}

#[derive(Serialize)]
struct CheckTokenBody<'a> {
    user_id: &'a str,
    token: &'a str,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum WireResult {
    Ok,
    AccountNotExist,
    PasswordError,
    TokenError,
    AccountExist,
    AccountEmpty,
    PasswordEmpty,
    AccountTooLong,
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct LoginReply {
    result: WireResult,
    #[serde(default)]
    token: String,
    #[serde(default)]
    user_id: String,
}

#[derive(Deserialize)]
struct SignupReply {
    result: WireResult,
    #[serde(default)]
    user_id: String,
}

#[derive(Deserialize)]
struct CheckTokenReply {
    result: WireResult,
}

fn login_result(result: WireResult) -> LoginResult {
    match result {
        WireResult::Ok => LoginResult::Ok,
        WireResult::AccountNotExist => LoginResult::AccountNotExist,
        WireResult::PasswordError => LoginResult::PasswordError,
        WireResult::TokenError => LoginResult::TokenError,
        _ => LoginResult::ServiceError,
    }
}

fn signup_result(result: WireResult) -> SignupResult {
    match result {
        WireResult::Ok => SignupResult::Ok,
        WireResult::AccountExist => SignupResult::AccountExist,
        WireResult::AccountEmpty => SignupResult::AccountEmpty,
        WireResult::PasswordEmpty => SignupResult::PasswordEmpty,
        WireResult::AccountTooLong => SignupResult::AccountTooLong,
        _ => SignupResult::ServiceError,
    }
}

/// JSON-over-HTTP client: `POST /login`, `POST /signup`, `POST /check_token`.
pub struct HttpAuthClient {
    base_url: Url,
    http: reqwest::Client,
}

impl HttpAuthClient {
    pub fn new(config: &AuthConfig) -> Result<Self, GatewayError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| GatewayError::AuthService(format!("invalid base URL: {e}")))?;
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { base_url, http })
    }

    async fn post<B: Serialize + Sync, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, GatewayError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| GatewayError::AuthService(format!("bad endpoint '{path}': {e}")))?;
        let res = self.http.post(url).json(body).send().await?;
        if !res.status().is_success() {
            return Err(GatewayError::AuthService(format!(
                "'{path}' responded with status {}",
                res.status()
            )));
        }
        Ok(res.json::<R>().await?)
    }
}

#[async_trait]
impl AuthService for HttpAuthClient {
    async fn login(&self, account: &str, credential: &Credential) -> LoginResponse {
        let body = match credential {
            Credential::Password(password) => LoginBody {
                account,
                password: Some(password),
                token: None,
            },
            Credential::Token(token) => LoginBody {
                account,
                password: None,
                token: Some(token),
            },
        };
        match self.post::<_, LoginReply>("login", &body).await {
            Ok(reply) => LoginResponse {
                result: login_result(reply.result),
                token: reply.token,
                user_id: reply.user_id,
            },
            Err(e) => {
                warn!("Auth service login call failed: {}", e);
                LoginResponse {
                    result: LoginResult::ServiceError,
                    token: String::new(),
                    user_id: String::new(),
                }
            }
        }
    }

    async fn signup(&self, account: &str, password: &str, user_name: &str) -> SignupResponse {
        let body = SignupBody {
            account,
            password,
            user_name,
        };
        match self.post::<_, SignupReply>("signup", &body).await {
            Ok(reply) => SignupResponse {
                result: signup_result(reply.result),
                user_id: reply.user_id,
            },
            Err(e) => {
                warn!("Auth service signup call failed: {}", e);
                SignupResponse {
                    result: SignupResult::ServiceError,
                    user_id: String::new(),
                }
            }
        }
    }

    async fn check_token(&self, user_id: &str, token: &str) -> LoginResult {
        let body = CheckTokenBody { user_id, token };
        match self.post::<_, CheckTokenReply>("check_token", &body).await {
            Ok(reply) => match reply.result {
                WireResult::Ok => LoginResult::Ok,
                WireResult::TokenError | WireResult::AccountNotExist => LoginResult::TokenError,
                _ => LoginResult::ServiceError,
            },
            Err(e) => {
                warn!("Auth service token check failed: {}", e);
                LoginResult::ServiceError
            }
        }
    }
}
