//! Account lifecycle emails, published as CloudEvents over AMQP.

use std::borrow::Cow;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::uri::{
    AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo,
};
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use rand::distributions::{Alphanumeric, DistString};
use rand::rngs::OsRng;
use serde::Serialize;
use url::Url;

use crate::config::Mail;

const DEFAULT_AMPQ_HOST: &str = "localhost";
const DEFAULT_AMPQ_PORT: u16 = 5672;
const DEFAULT_AMPQ_VHOST: &str = "/";

const CONTENT_ENCODING: &str = "utf8";
const CONTENT_TYPE: &str = "application/cloudevents+json";
const DATA_CONTENT_TYPE: &str = "application/json";
const CLOUDEVENT_VERSION: &str = "1.0";
const ID_LENGTH: usize = 12;

/// Retry policy for transient broker failures.
pub const MAX_SEND_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    /// Broker unreachable or channel lost. Worth retrying.
    #[error("mail broker connection failed: {0}")]
    Connection(String),
    /// The broker refused the message.
    #[error("mail publish failed: {0}")]
    Publish(String),
    #[error("mail configuration invalid: {0}")]
    Config(String),
}

impl MailError {
    /// Only connection-level failures are retried; a refused publish or a
    /// bad configuration will not get better on its own.
    pub fn is_transient(&self) -> bool {
        matches!(self, MailError::Connection(_))
    }
}

/// Mail templates list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Template {
    /// Activation link for a freshly registered account.
    AccountActivation,
    /// Confirmation that the account is now active.
    ActivationConfirm,
    /// Password-reset link.
    PasswordReset,
}

#[derive(Debug, Serialize)]
struct Cloudevent<'a> {
    specversion: &'static str,
    r#type: &'static str,
    source: &'static str,
    id: String,
    time: String,
    datacontenttype: &'static str,
    data: Content<'a>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    to: Cow<'a, str>,
    template: Template,
    username: Cow<'a, str>,
    /// Opaque credential embedded in the mail, when the template carries one.
    token: Option<Cow<'a, str>>,
}

/// Deliver an account email. Implemented over AMQP in production and by
/// recording doubles in tests.
pub trait Mailer: Clone + Send + Sync + 'static {
    fn send(
        &self,
        template: Template,
        to: &str,
        username: &str,
        token: Option<&str>,
    ) -> impl Future<Output = Result<(), MailError>> + Send;
}

/// Retry `operation` on transient failures with a linearly growing delay.
pub async fn with_retry<T, F, Fut>(
    max_attempts: u32,
    mut operation: F,
) -> Result<T, MailError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, MailError>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                tracing::warn!(%err, attempt, "transient mail failure, retrying");
                tokio::time::sleep(RETRY_BASE_DELAY * attempt).await;
                attempt += 1;
            },
            Err(err) => return Err(err),
        }
    }
}

/// AMQP-backed mail publisher.
///
/// The default instance holds no connection and drops messages with a log
/// line, which keeps local development usable without a broker.
#[derive(Debug, Clone, Default)]
pub struct MailManager {
    queue: String,
    conn: Option<Arc<Connection>>,
}

impl MailManager {
    /// Create a new [`MailManager`].
    pub async fn new(config: &Mail) -> Result<Self, MailError> {
        let addr = Url::parse(&config.address)
            .map_err(|err| MailError::Config(err.to_string()))?;
        let uri = AMQPUri {
            scheme: AMQPScheme::from_str(addr.scheme()).map_err(|_| {
                MailError::Config("unsupported amqp scheme".into())
            })?,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: config.username.clone(),
                    password: config.password.clone(),
                },
                host: addr.host_str().unwrap_or(DEFAULT_AMPQ_HOST).into(),
                port: addr.port().unwrap_or(DEFAULT_AMPQ_PORT),
            },
            vhost: config
                .vhost
                .clone()
                .unwrap_or(DEFAULT_AMPQ_VHOST.to_string()),
            query: AMQPQueryString {
                channel_max: config.pool,
                ..Default::default()
            },
        };

        let conn_config = ConnectionProperties::default()
            .with_connection_name("portcullis_mail_client".into());
        let conn = Connection::connect_uri(uri, conn_config)
            .await
            .map_err(|err| MailError::Connection(err.to_string()))?;

        tracing::info!(%addr, "rabbitmq connected");

        Ok(Self {
            queue: config.queue.clone(),
            conn: Some(Arc::new(conn)),
        })
    }

    async fn create_channel(
        conn: Arc<Connection>,
        queue: &str,
    ) -> Result<Channel, MailError> {
        let channel = conn
            .create_channel()
            .await
            .map_err(|err| MailError::Connection(err.to_string()))?;
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| MailError::Connection(err.to_string()))?;
        Ok(channel)
    }

    fn create_event(data: Content) -> Cloudevent {
        let id = Alphanumeric.sample_string(&mut OsRng, ID_LENGTH);
        Cloudevent {
            specversion: CLOUDEVENT_VERSION,
            r#type: "org.portcullis.email",
            source: "org.portcullis.api",
            id,
            time: Utc::now().to_rfc3339(),
            datacontenttype: DATA_CONTENT_TYPE,
            data,
        }
    }

    async fn publish(
        &self,
        template: Template,
        to: &str,
        username: &str,
        token: Option<&str>,
    ) -> Result<(), MailError> {
        let Some(conn) = &self.conn else {
            tracing::debug!(?template, "no mail broker configured, event dropped");
            return Ok(());
        };
        let channel =
            Self::create_channel(Arc::clone(conn), &self.queue).await?;

        let content = Content {
            to: Cow::from(to),
            template,
            username: Cow::from(username),
            token: token.map(Cow::from),
        };
        let payload = Self::create_event(content);
        let payload = serde_json::to_string(&payload)
            .map_err(|err| MailError::Publish(err.to_string()))?;

        channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                payload.as_bytes(),
                BasicProperties::default()
                    .with_content_encoding(CONTENT_ENCODING.into())
                    .with_content_type(CONTENT_TYPE.into()),
            )
            .await
            .map_err(|err| MailError::Publish(err.to_string()))?;

        tracing::trace!(?template, "mail event sent");

        Ok(())
    }
}

impl Mailer for MailManager {
    async fn send(
        &self,
        template: Template,
        to: &str,
        username: &str,
        token: Option<&str>,
    ) -> Result<(), MailError> {
        with_retry(MAX_SEND_ATTEMPTS, || {
            self.publish(template, to, username, token)
        })
        .await
    }
}
