use std::sync::Arc;

use async_imap::Session;
use async_trait::async_trait;
use cdrl_core::MessageHandle;
use chrono::NaiveDate;
use futures::{pin_mut, TryStreamExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::{date_header_value, MailConfig, MailError, MailSession};

type ImapSession = Session<TlsStream<TcpStream>>;

/// IMAP-over-TLS mailbox session.
pub struct ImapMailSession {
    session: ImapSession,
}

impl ImapMailSession {
    pub async fn connect(config: &MailConfig) -> Result<Self, MailError> {
        let tcp = TcpStream::connect((config.server.as_str(), config.port))
            .await
            .map_err(|err| MailError::Connect(format!("{}:{}: {err}", config.server, config.port)))?;

        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let tls_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let server_name = ServerName::try_from(config.server.clone())
            .map_err(|err| MailError::Connect(format!("invalid server name {}: {err}", config.server)))?;
        let tls = TlsConnector::from(Arc::new(tls_config))
            .connect(server_name, tcp)
            .await
            .map_err(|err| MailError::Connect(format!("tls handshake with {}: {err}", config.server)))?;

        let client = async_imap::Client::new(tls);
        let mut session = client
            .login(&config.username, &config.password)
            .await
            .map_err(|(err, _)| MailError::Login(err.to_string()))?;
        session
            .select(&config.mailbox)
            .await
            .map_err(|err| MailError::Protocol(format!("select {}: {err}", config.mailbox)))?;
        info!(server = %config.server, mailbox = %config.mailbox, "connected to mailbox");

        Ok(Self { session })
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

#[async_trait]
impl MailSession for ImapMailSession {
    async fn search(
        &mut self,
        subject: &str,
        since: NaiveDate,
    ) -> Result<Vec<MessageHandle>, MailError> {
        let query = format!("SUBJECT {} SINCE {}", quote(subject), since.format("%d-%b-%Y"));
        debug!(%query, "searching mailbox");
        let uids = self
            .session
            .uid_search(&query)
            .await
            .map_err(|err| MailError::Protocol(format!("search failed: {err}")))?;
        let mut handles: Vec<MessageHandle> = uids.into_iter().map(MessageHandle).collect();
        handles.sort();
        Ok(handles)
    }

    async fn fetch_date_header(
        &mut self,
        handle: MessageHandle,
    ) -> Result<Option<String>, MailError> {
        let stream = self
            .session
            .uid_fetch(handle.to_string(), "RFC822.HEADER")
            .await
            .map_err(|err| MailError::Protocol(format!("fetch header {handle}: {err}")))?;
        pin_mut!(stream);
        let mut date = None;
        let mut seen = false;
        while let Some(fetch) = stream
            .try_next()
            .await
            .map_err(|err| MailError::Protocol(format!("fetch header {handle}: {err}")))?
        {
            if let Some(header) = fetch.header() {
                seen = true;
                if date.is_none() {
                    date = date_header_value(header);
                }
            }
        }
        if !seen {
            return Err(MailError::MissingMessage(handle));
        }
        Ok(date)
    }

    async fn fetch_message(&mut self, handle: MessageHandle) -> Result<Vec<u8>, MailError> {
        let stream = self
            .session
            .uid_fetch(handle.to_string(), "BODY.PEEK[]")
            .await
            .map_err(|err| MailError::Protocol(format!("fetch body {handle}: {err}")))?;
        pin_mut!(stream);
        let mut body = None;
        while let Some(fetch) = stream
            .try_next()
            .await
            .map_err(|err| MailError::Protocol(format!("fetch body {handle}: {err}")))?
        {
            if body.is_none() {
                body = fetch.body().map(<[u8]>::to_vec);
            }
        }
        body.ok_or(MailError::MissingMessage(handle))
    }

    async fn close(&mut self) -> Result<(), MailError> {
        self.session
            .logout()
            .await
            .map_err(|err| MailError::Protocol(format!("logout failed: {err}")))
    }
}
