//! Destinations for encoded snapshots.

use std::{
    io::Write,
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};

use reqwest::blocking::{
    Client,
    multipart::{Form, Part},
};
use tracing::{debug, info, warn};

use crate::transport::TransportError;

/// One snapshot destination. The worker calls every configured sink with
/// the same JPEG and records each outcome independently.
pub trait ImageSink: Send {
    fn name(&self) -> &'static str;

    fn deliver(&mut self, jpeg: &[u8], caption: &str) -> Result<(), TransportError>;
}

const TELEGRAM_API: &str = "https://api.telegram.org";

/// Telegram bot `sendPhoto` upload.
pub struct TelegramSink {
    client: Client,
    api_base: String,
    token: String,
    chat_id: String,
    timeout: Duration,
}

impl TelegramSink {
    pub fn new(client: Client, token: String, chat_id: String, timeout: Duration) -> Self {
        Self::with_api_base(client, TELEGRAM_API.to_string(), token, chat_id, timeout)
    }

    fn with_api_base(
        client: Client,
        api_base: String,
        token: String,
        chat_id: String,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
            chat_id,
            timeout,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/bot{}/sendPhoto", self.api_base, self.token)
    }
}

impl ImageSink for TelegramSink {
    fn name(&self) -> &'static str {
        "telegram"
    }

    fn deliver(&mut self, jpeg: &[u8], caption: &str) -> Result<(), TransportError> {
        if self.token.is_empty() || self.chat_id.is_empty() {
            return Err(TransportError::Config(
                "telegram token and chat id are required".into(),
            ));
        }
        let photo = Part::bytes(jpeg.to_vec())
            .file_name("photo.jpg")
            .mime_str("image/jpeg")?;
        let mut form = Form::new()
            .text("chat_id", self.chat_id.clone())
            .part("photo", photo);
        if !caption.is_empty() {
            form = form.text("caption", caption.to_string());
        }

        let response = self
            .client
            .post(self.endpoint())
            .timeout(self.timeout)
            .multipart(form)
            .send()?;
        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().unwrap_or_default();
            if status == 400 {
                warn!(%body, "telegram rejected the upload; check the chat id");
            } else {
                debug!(status, %body, "telegram upload failed");
            }
            return Err(TransportError::Status(status));
        }
        info!(bytes = jpeg.len(), "snapshot delivered to telegram");
        Ok(())
    }
}

/// Object-storage upload that overwrites one fixed object per bucket.
pub struct ObjectStorageSink {
    client: Client,
    base_url: String,
    service_key: String,
    bucket: String,
    object: String,
    timeout: Duration,
}

impl ObjectStorageSink {
    pub const DEFAULT_OBJECT: &'static str = "motion.jpg";

    pub fn new(
        client: Client,
        base_url: String,
        service_key: String,
        bucket: String,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            bucket,
            object: Self::DEFAULT_OBJECT.to_string(),
            timeout,
        }
    }

    pub fn upload_url(&self) -> String {
        format!(
            "{}/storage/v1/object/{}/{}",
            self.base_url, self.bucket, self.object
        )
    }

    pub fn public_url(&self) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url, self.bucket, self.object
        )
    }
}

impl ImageSink for ObjectStorageSink {
    fn name(&self) -> &'static str {
        "object_storage"
    }

    fn deliver(&mut self, jpeg: &[u8], _caption: &str) -> Result<(), TransportError> {
        if self.service_key.is_empty() || self.bucket.is_empty() {
            return Err(TransportError::Config(
                "object storage key and bucket are required".into(),
            ));
        }
        let response = self
            .client
            .put(self.upload_url())
            .timeout(self.timeout)
            .header("Content-Type", "image/jpeg")
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .header("x-upsert", "true")
            .body(jpeg.to_vec())
            .send()?;
        let status = response.status().as_u16();
        let body = response.text().unwrap_or_default();
        if status != 200 {
            debug!(status, %body, "object storage upload failed");
            return Err(TransportError::Status(status));
        }
        info!(url = %self.public_url(), "snapshot uploaded");
        Ok(())
    }
}

/// Raw TCP receiver. Each image is one connection carrying
/// `[u32 big-endian length][jpeg bytes]`.
pub struct TcpFrameSink {
    addr: String,
    timeout: Duration,
}

impl TcpFrameSink {
    pub fn new(addr: String, timeout: Duration) -> Self {
        Self { addr, timeout }
    }
}

impl ImageSink for TcpFrameSink {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn deliver(&mut self, jpeg: &[u8], _caption: &str) -> Result<(), TransportError> {
        let len = u32::try_from(jpeg.len())
            .map_err(|_| TransportError::Config("jpeg larger than 4 GiB".into()))?;
        let addr = self
            .addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| TransportError::Config(format!("cannot resolve {}", self.addr)))?;

        let mut stream = TcpStream::connect_timeout(&addr, self.timeout)?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.write_all(&len.to_be_bytes())?;
        stream.write_all(jpeg)?;
        stream.flush()?;
        debug!(%addr, bytes = jpeg.len(), "snapshot streamed over tcp");
        Ok(())
    }
}
