/*
 * SPDX-FileCopyrightText: 2024 Pelican Mail Project <dev@pelicanmail.org>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod address;
pub mod auth;
pub mod buffer;
pub mod error;
pub mod future;
pub mod limiter;

pub static DAEMON_NAME: &str = concat!("Pelican Mail Server v", env!("CARGO_PKG_VERSION"),);
