// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2026 Meshwork Contributors
//
// This file is part of Meshwork.
//
// Meshwork is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// Meshwork is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with Meshwork. If not, see <https://www.gnu.org/licenses/>.

//! Wire records and their binary codecs.
//!
//! ## Purpose
//! Three transient protocol records cross the messaging boundary:
//! [`Notify`] (a notify/notify-all event), [`ClientServerExchangeLockContext`]
//! (the server's authoritative view of one client's participation, used
//! during resynchronization) and [`RecallBatchContext`] (all participants a
//! greedy holder reports back during a recall, batched to amortize round
//! trips).
//!
//! ## Layout
//! All integers are big-endian. A [`LockID`](crate::ids::LockID) is a
//! one-byte variant tag followed by the variant payload; strings are
//! u32-length-prefixed UTF-8. The exchange context writes its 8-byte
//! timeout only when the state's kind is Waiter or TryPending.

use bytes::{Buf, BufMut};

use crate::error::{LockError, LockResult};
use crate::ids::{ClientID, LiteralValue, LockID, ObjectID, ThreadID};
use crate::state::{ContextType, State};

fn need(buf: &impl Buf, n: usize, what: &str) -> LockResult<()> {
    if buf.remaining() < n {
        return Err(LockError::Codec(format!(
            "truncated input: need {} bytes for {}, have {}",
            n,
            what,
            buf.remaining()
        )));
    }
    Ok(())
}

fn put_string<B: BufMut>(buf: &mut B, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_string<B: Buf>(buf: &mut B, what: &str) -> LockResult<String> {
    need(buf, 4, what)?;
    let len = buf.get_u32() as usize;
    need(buf, len, what)?;
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec())
        .map_err(|e| LockError::Codec(format!("invalid UTF-8 in {}: {}", what, e)))
}

impl LiteralValue {
    fn value_tag(&self) -> u8 {
        match self {
            LiteralValue::Boolean(_) => 0,
            LiteralValue::Integer(_) => 1,
            LiteralValue::Character(_) => 2,
            LiteralValue::Text(_) => 3,
            LiteralValue::EnumConstant { .. } => 4,
        }
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.value_tag());
        match self {
            LiteralValue::Boolean(b) => buf.put_u8(*b as u8),
            LiteralValue::Integer(i) => buf.put_i64(*i),
            LiteralValue::Character(c) => buf.put_u32(*c as u32),
            LiteralValue::Text(s) => put_string(buf, s),
            LiteralValue::EnumConstant { class, name } => {
                put_string(buf, class);
                put_string(buf, name);
            }
        }
    }

    fn decode<B: Buf>(buf: &mut B) -> LockResult<LiteralValue> {
        need(buf, 1, "literal value tag")?;
        match buf.get_u8() {
            0 => {
                need(buf, 1, "boolean literal")?;
                Ok(LiteralValue::Boolean(buf.get_u8() != 0))
            }
            1 => {
                need(buf, 8, "integer literal")?;
                Ok(LiteralValue::Integer(buf.get_i64()))
            }
            2 => {
                need(buf, 4, "character literal")?;
                let raw = buf.get_u32();
                char::from_u32(raw)
                    .map(LiteralValue::Character)
                    .ok_or_else(|| {
                        LockError::Codec(format!("invalid character literal: {:#x}", raw))
                    })
            }
            3 => Ok(LiteralValue::Text(get_string(buf, "text literal")?)),
            4 => Ok(LiteralValue::EnumConstant {
                class: get_string(buf, "enum literal class")?,
                name: get_string(buf, "enum literal name")?,
            }),
            tag => Err(LockError::Codec(format!("unknown literal value tag {}", tag))),
        }
    }
}

impl LockID {
    /// Write the one-byte variant tag followed by the variant payload.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.tag());
        match self {
            LockID::Numeric(n) => buf.put_i64(*n),
            LockID::Str(s) => put_string(buf, s),
            LockID::Object(o) => buf.put_u64(o.0),
            LockID::Literal(v) => v.encode(buf),
            LockID::VolatileField { object, field } => {
                buf.put_u64(object.0);
                put_string(buf, field);
            }
        }
    }

    pub fn decode<B: Buf>(buf: &mut B) -> LockResult<LockID> {
        need(buf, 1, "lock id tag")?;
        match buf.get_u8() {
            0 => {
                need(buf, 8, "numeric lock id")?;
                Ok(LockID::Numeric(buf.get_i64()))
            }
            1 => Ok(LockID::Str(get_string(buf, "string lock id")?)),
            2 => {
                need(buf, 8, "object lock id")?;
                Ok(LockID::Object(ObjectID(buf.get_u64())))
            }
            3 => Ok(LockID::Literal(LiteralValue::decode(buf)?)),
            4 => {
                need(buf, 8, "volatile-field lock id")?;
                let object = ObjectID(buf.get_u64());
                let field = get_string(buf, "volatile-field name")?;
                Ok(LockID::VolatileField { object, field })
            }
            tag => Err(LockError::Codec(format!("unknown lock id tag {}", tag))),
        }
    }
}

/// A serializable notify / notify-all event. Immutable once constructed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notify {
    pub lock_id: LockID,
    pub thread_id: ThreadID,
    pub all: bool,
}

impl Notify {
    /// The "no notify pending" singleton.
    pub const NULL: Notify = Notify {
        lock_id: LockID::Numeric(i64::MIN),
        thread_id: ThreadID::NIL,
        all: false,
    };

    pub fn new(lock_id: LockID, thread_id: ThreadID, all: bool) -> Notify {
        Notify { lock_id, thread_id, all }
    }

    pub fn is_null(&self) -> bool {
        *self == Notify::NULL
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        self.lock_id.encode(buf);
        buf.put_i64(self.thread_id.0);
        buf.put_u8(self.all as u8);
    }

    pub fn decode<B: Buf>(buf: &mut B) -> LockResult<Notify> {
        let lock_id = LockID::decode(buf)?;
        need(buf, 9, "notify thread id and flag")?;
        let thread_id = ThreadID(buf.get_i64());
        let all = buf.get_u8() != 0;
        Ok(Notify { lock_id, thread_id, all })
    }
}

/// Wire snapshot of one (client, thread) lock participation.
///
/// The timeout (milliseconds, -1 for indefinite) is present on the wire
/// only when the state's kind is Waiter or TryPending.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientServerExchangeLockContext {
    pub lock_id: LockID,
    pub node_id: ClientID,
    pub thread_id: ThreadID,
    pub state: State,
    pub timeout_millis: Option<i64>,
}

impl ClientServerExchangeLockContext {
    pub fn new(
        lock_id: LockID,
        node_id: ClientID,
        thread_id: ThreadID,
        state: State,
    ) -> ClientServerExchangeLockContext {
        ClientServerExchangeLockContext {
            lock_id,
            node_id,
            thread_id,
            state,
            timeout_millis: None,
        }
    }

    pub fn with_timeout(
        lock_id: LockID,
        node_id: ClientID,
        thread_id: ThreadID,
        state: State,
        timeout_millis: i64,
    ) -> ClientServerExchangeLockContext {
        ClientServerExchangeLockContext {
            lock_id,
            node_id,
            thread_id,
            state,
            timeout_millis: Some(timeout_millis),
        }
    }

    fn carries_timeout(&self) -> bool {
        matches!(
            self.state.kind(),
            ContextType::Waiter | ContextType::TryPending
        )
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        self.lock_id.encode(buf);
        buf.put_u64(self.node_id.0);
        buf.put_i64(self.thread_id.0);
        buf.put_u32(self.state.ordinal());
        if self.carries_timeout() {
            buf.put_i64(self.timeout_millis.unwrap_or(-1));
        }
    }

    pub fn decode<B: Buf>(buf: &mut B) -> LockResult<ClientServerExchangeLockContext> {
        let lock_id = LockID::decode(buf)?;
        need(buf, 20, "exchange context header")?;
        let node_id = ClientID(buf.get_u64());
        let thread_id = ThreadID(buf.get_i64());
        let ordinal = buf.get_u32();
        let state = State::from_ordinal(ordinal)
            .ok_or_else(|| LockError::Codec(format!("unknown state ordinal {}", ordinal)))?;
        let mut ctx = ClientServerExchangeLockContext::new(lock_id, node_id, thread_id, state);
        if ctx.carries_timeout() {
            need(buf, 8, "exchange context timeout")?;
            ctx.timeout_millis = Some(buf.get_i64());
        }
        Ok(ctx)
    }
}

/// All participants a greedy holder reports for one lock during a recall.
///
/// Every member context carries the batch's lock id; constructing or
/// decoding a batch with a foreign member fails.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecallBatchContext {
    lock_id: LockID,
    contexts: Vec<ClientServerExchangeLockContext>,
}

impl RecallBatchContext {
    pub fn new(
        lock_id: LockID,
        contexts: Vec<ClientServerExchangeLockContext>,
    ) -> LockResult<RecallBatchContext> {
        if let Some(foreign) = contexts.iter().find(|c| c.lock_id != lock_id) {
            return Err(LockError::ProtocolViolation(format!(
                "recall batch for {} contains context for {}",
                lock_id, foreign.lock_id
            )));
        }
        Ok(RecallBatchContext { lock_id, contexts })
    }

    pub fn lock_id(&self) -> &LockID {
        &self.lock_id
    }

    pub fn contexts(&self) -> &[ClientServerExchangeLockContext] {
        &self.contexts
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        self.lock_id.encode(buf);
        buf.put_u32(self.contexts.len() as u32);
        for ctx in &self.contexts {
            ctx.encode(buf);
        }
    }

    pub fn decode<B: Buf>(buf: &mut B) -> LockResult<RecallBatchContext> {
        let lock_id = LockID::decode(buf)?;
        need(buf, 4, "recall batch count")?;
        let count = buf.get_u32() as usize;
        let mut contexts = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let ctx = ClientServerExchangeLockContext::decode(buf)?;
            if ctx.lock_id != lock_id {
                return Err(LockError::Codec(format!(
                    "recall batch for {} contains context for {}",
                    lock_id, ctx.lock_id
                )));
            }
            contexts.push(ctx);
        }
        Ok(RecallBatchContext { lock_id, contexts })
    }
}
