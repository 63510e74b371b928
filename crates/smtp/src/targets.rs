/*
 * SPDX-FileCopyrightText: 2024 Pelican Mail Project <dev@pelicanmail.org>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::{
    fs,
    io::{self, Write},
    path::PathBuf,
    sync::Arc,
};

use async_trait::async_trait;
use common::{
    address,
    buffer::Buffer,
    error::{Error, Result},
};

use crate::{
    core::MsgMetadata,
    delivery::{Delivery, StatusCollector, Target},
};

/// Maildir-style local delivery: one directory per recipient under the
/// root, messages land in `new/`. Failures are reported per recipient.
pub struct MaildirTarget {
    root: PathBuf,
}

impl MaildirTarget {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        MaildirTarget { root: root.into() }
    }
}

#[async_trait]
impl Target for MaildirTarget {
    async fn start(&self, meta: &MsgMetadata, _mail_from: &str) -> Result<Box<dyn Delivery>> {
        Ok(Box::new(MaildirDelivery {
            root: self.root.clone(),
            id: meta.id.clone(),
            rcpts: Vec::new(),
            staged: Vec::new(),
        }))
    }
}

struct MaildirDelivery {
    root: PathBuf,
    id: String,
    rcpts: Vec<String>,
    /// Files written to `tmp/`, moved to `new/` at commit.
    staged: Vec<(PathBuf, PathBuf)>,
}

impl MaildirDelivery {
    fn write_rcpt(&mut self, rcpt: &str, header: &[u8], body: &Arc<dyn Buffer>) -> io::Result<()> {
        let mailbox = self.root.join(address::fold_case(rcpt));
        fs::create_dir_all(mailbox.join("tmp"))?;
        fs::create_dir_all(mailbox.join("new"))?;
        let tmp = mailbox.join("tmp").join(format!("{}.eml", self.id));
        let dest = mailbox.join("new").join(format!("{}.eml", self.id));
        let mut file = fs::File::create(&tmp)?;
        file.write_all(header)?;
        let mut reader = body.open()?;
        io::copy(&mut reader, &mut file)?;
        file.sync_all()?;
        self.staged.push((tmp, dest));
        Ok(())
    }
}

#[async_trait]
impl Delivery for MaildirDelivery {
    async fn add_rcpt(&mut self, rcpt: &str) -> Result<()> {
        self.rcpts.push(rcpt.to_string());
        Ok(())
    }

    async fn body(&mut self, header: &[u8], body: Arc<dyn Buffer>) -> Result<()> {
        for rcpt in self.rcpts.clone() {
            self.write_rcpt(&rcpt, header, &body)
                .map_err(Error::InternalIo)?;
        }
        Ok(())
    }

    fn supports_partial(&self) -> bool {
        true
    }

    async fn body_non_atomic(
        &mut self,
        collector: &StatusCollector,
        _rcpts: &[String],
        header: &[u8],
        body: Arc<dyn Buffer>,
    ) {
        for rcpt in self.rcpts.clone() {
            if let Err(err) = self.write_rcpt(&rcpt, header, &body) {
                collector.set_status(&rcpt, Error::InternalIo(err));
            }
        }
    }

    async fn commit(&mut self) -> Result<()> {
        for (tmp, dest) in self.staged.drain(..) {
            fs::rename(&tmp, &dest).map_err(Error::InternalIo)?;
        }
        Ok(())
    }

    async fn abort(&mut self) -> Result<()> {
        for (tmp, _) in self.staged.drain(..) {
            let _ = fs::remove_file(tmp);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use common::buffer::MemoryBuffer;

    use super::*;

    #[tokio::test]
    async fn delivers_to_each_recipient() {
        let root = std::env::temp_dir().join(format!("pelican-maildir-{:08x}", rand::random::<u32>()));
        let target = MaildirTarget::new(&root);
        let meta = MsgMetadata::new(None, "sender@example.org");
        let id = meta.id.clone();

        let mut delivery = target.start(&meta, "sender@example.org").await.unwrap();
        delivery.add_rcpt("a@example.com").await.unwrap();
        delivery.add_rcpt("B@example.com").await.unwrap();
        let body: Arc<dyn Buffer> = Arc::new(MemoryBuffer::new(b"hello\r\n".to_vec()));
        delivery.body(b"Subject: x\r\n\r\n", body).await.unwrap();
        delivery.commit().await.unwrap();

        for rcpt in ["a@example.com", "b@example.com"] {
            let path = root.join(rcpt).join("new").join(format!("{id}.eml"));
            let contents = fs::read(path).unwrap();
            assert_eq!(contents, b"Subject: x\r\n\r\nhello\r\n");
        }
    }
}
