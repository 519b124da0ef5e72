/*
 * lib.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Phineas, a store-and-forward ebXML messaging node.
 *
 * Phineas is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Phineas is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Phineas.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Phineas core: a store-and-forward messaging node for secure B2B file
//! exchange over the ebXML SOAP-with-attachments profile.
//!
//! The sender half watches folders, wraps files in signed/encrypted
//! envelopes and delivers them over HTTP(S) with retry; the receiver
//! half terminates inbound HTTP(S), unwraps payloads and acknowledges.
//! Every hand-off is persisted in a durable queue so retries survive
//! restarts.

pub mod basicauth;
pub mod config;
pub mod crypto;
pub mod filter;
pub mod mime;
pub mod net;
pub mod payload;
pub mod queue;
pub mod receiver;
pub mod runtime;
pub mod sender;
pub mod server;
pub mod soap;
pub mod stamp;
pub mod taskq;
pub mod xml;
