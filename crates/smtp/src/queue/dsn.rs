/*
 * SPDX-FileCopyrightText: 2024 Pelican Mail Project <dev@pelicanmail.org>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::{fmt::Write, sync::Arc};

use common::{
    buffer::MemoryBuffer,
    error::{Error, Result},
};
use mail_builder::{
    headers::{content_type::ContentType, HeaderType},
    mime::{BodyPart, MimePart},
    MessageBuilder,
};

use crate::{core::MsgMetadata, delivery::Target};

use super::QueueMetadata;

/// Builds a multipart/report delivery-status notification for the
/// permanently failed recipients of a message and submits it to the bounce
/// pipeline with the null reverse-path. Returns the DSN's message id.
///
/// Original recipient addresses are restored from the rewrite map before
/// they appear in the report.
pub async fn send_dsn(
    hostname: &str,
    autogen_domain: &str,
    meta: &QueueMetadata,
    original_header: &[u8],
    bounce: &Arc<dyn Target>,
) -> Result<String> {
    let mut dsn_meta = MsgMetadata::new(None, "");
    dsn_meta.dsn = true;
    let dsn_id = dsn_meta.id.clone();
    let from_addr = format!("MAILER-DAEMON@{autogen_domain}");

    let mut text = String::with_capacity(512);
    let _ = write!(
        text,
        "This is the mail system at host {hostname}.\r\n\r\n\
         I'm sorry to have to inform you that your message could not\r\n\
         be delivered to one or more recipients.\r\n\r\n\
         For further assistance, please send mail to postmaster.\r\n"
    );
    for rcpt in &meta.failed_rcpts {
        let original = meta.msg_meta.original_rcpt(rcpt);
        let reason = meta
            .rcpt_errs
            .get(rcpt)
            .map(|status| status.to_string())
            .unwrap_or_else(|| "delivery failed".to_string());
        let _ = write!(text, "\r\n<{original}>: {reason}\r\n");
    }

    let mut report = String::with_capacity(512);
    let _ = write!(
        report,
        "Reporting-MTA: dns; {hostname}\r\nArrival-Date: {}\r\n",
        meta.first_attempt.to_rfc2822()
    );
    for rcpt in &meta.failed_rcpts {
        let original = meta.msg_meta.original_rcpt(rcpt);
        let _ = write!(report, "\r\nOriginal-Recipient: rfc822; {original}\r\n");
        let _ = write!(report, "Final-Recipient: rfc822; {rcpt}\r\n");
        let _ = write!(report, "Action: failed\r\n");
        match meta.rcpt_errs.get(rcpt) {
            Some(status) => {
                let _ = write!(
                    report,
                    "Status: {}.{}.{}\r\nDiagnostic-Code: smtp; {} {}\r\n",
                    status.enhanced.0,
                    status.enhanced.1,
                    status.enhanced.2,
                    status.code,
                    status.message
                );
            }
            None => {
                let _ = write!(report, "Status: 5.0.0\r\n");
            }
        }
    }

    let original_header = String::from_utf8_lossy(original_header).into_owned();
    let message = MessageBuilder::new()
        .from(("Mail Delivery Subsystem", from_addr.as_str()))
        .header("To", HeaderType::Text(meta.from.as_str().into()))
        .header("Auto-Submitted", HeaderType::Text("auto-replied".into()))
        .message_id(format!("{dsn_id}@{autogen_domain}"))
        .subject("Delivery Status Notification (Failure)")
        .body(MimePart::new(
            ContentType::new("multipart/report").attribute("report-type", "delivery-status"),
            BodyPart::Multipart(vec![
                MimePart::new(ContentType::new("text/plain"), BodyPart::Text(text.into())),
                MimePart::new(
                    ContentType::new("message/delivery-status"),
                    BodyPart::Text(report.into()),
                ),
                MimePart::new(
                    ContentType::new("text/rfc822-headers"),
                    BodyPart::Text(original_header.into()),
                ),
            ]),
        ))
        .write_to_vec()
        .map_err(Error::InternalIo)?;

    // Hand the generated message to the bounce pipeline through the normal
    // target contract, split at the header/body boundary.
    let split = message
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|at| at + 4)
        .unwrap_or(message.len());
    let (header, body) = message.split_at(split);

    let mut delivery = bounce.start(&dsn_meta, "").await?;
    delivery.add_rcpt(&meta.from).await?;
    if let Err(err) = delivery
        .body(header, Arc::new(MemoryBuffer::new(body.to_vec())))
        .await
    {
        let _ = delivery.abort().await;
        return Err(err);
    }
    delivery.commit().await?;
    Ok(dsn_id)
}
