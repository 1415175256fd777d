// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License:
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! Runtime support for reading and writing Cap'n Proto messages as idiomatic
//! Rust types.
//!
//! Cap'n Proto is a serialization protocol designed for extreme performance.
//! Please see the [Cap'n Proto documentation](https://capnproto.org) for
//! more about its goals and design.
//!
//! This crate implements the encoding only: a zero-copy, bounds-checked view
//! over in-memory messages, plus the multi-segment framing and byte-packing
//! codecs used to move those messages across the wire. It does not include
//! the schema compiler or RPC layer.
//!
//! The key types are [message::Reader] and [message::Builder], which
//! respectively allow for reading and building Cap'n Proto messages.
//! Code generated by `capnpc` provides typed wrappers around the low-level
//! accessors exposed here; this crate can also be used directly, through
//! the [any_pointer] interface, by programs that want to manipulate
//! messages without a compiled schema.

#![cfg_attr(not(feature = "std"), no_std)]
#![allow(clippy::missing_safety_doc)]

#[cfg(feature = "alloc")]
extern crate alloc;
#[cfg(not(feature = "alloc"))]
extern crate core as alloc;

#[cfg(feature = "alloc")]
pub mod any_pointer;
#[cfg(feature = "alloc")]
pub mod data;
#[cfg(feature = "alloc")]
pub mod data_list;
#[cfg(feature = "alloc")]
pub mod list_list;
#[cfg(feature = "alloc")]
pub mod message;
pub mod primitive_list;
#[cfg(feature = "alloc")]
pub mod serialize;
#[cfg(feature = "alloc")]
pub mod serialize_packed;
#[cfg(feature = "alloc")]
pub mod struct_list;
#[cfg(feature = "alloc")]
pub mod text;
#[cfg(feature = "alloc")]
pub mod text_list;
#[cfg(feature = "alloc")]
pub mod traits;

#[cfg(feature = "alloc")]
pub mod private {
    pub mod arena;
    pub mod layout;
    pub mod units;
}

use core::fmt;

/// An 8-byte word, the unit of allocation and alignment in a Cap'n Proto
/// message.
///
/// `Word` has no accessible fields; use [`Word::bytes`]/[`Word::bytes_mut`]
/// to get at the underlying bytes, or [`Word::from`] to construct one.
#[derive(Clone, Copy)]
#[repr(align(8))]
pub struct Word([u8; 8]);

impl Word {
    /// The zero word.
    pub const NULL: Word = Word([0; 8]);

    #[cfg(feature = "alloc")]
    pub fn allocate_zeroed_vec(length: usize) -> alloc::vec::Vec<Word> {
        alloc::vec![Word::NULL; length]
    }

    pub fn bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn bytes_mut(&mut self) -> &mut [u8; 8] {
        &mut self.0
    }

    /// Reinterprets a byte slice as a slice of words.
    ///
    /// Panics if the length of `bytes` is not a multiple of 8 or if `bytes`
    /// is insufficiently aligned.
    pub fn bytes_to_words(bytes: &[u8]) -> &[Word] {
        assert_eq!(bytes.len() % 8, 0);
        #[cfg(not(feature = "unaligned"))]
        assert_eq!(bytes.as_ptr() as usize % 8, 0, "input is not 8-byte aligned");
        unsafe { core::slice::from_raw_parts(bytes.as_ptr() as *const Word, bytes.len() / 8) }
    }

    pub fn words_to_bytes(words: &[Word]) -> &[u8] {
        unsafe { core::slice::from_raw_parts(words.as_ptr() as *const u8, words.len() * 8) }
    }

    pub fn words_to_bytes_mut(words: &mut [Word]) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(words.as_mut_ptr() as *mut u8, words.len() * 8) }
    }
}

impl Default for Word {
    fn default() -> Self {
        Word::NULL
    }
}

impl fmt::Debug for Word {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl PartialEq for Word {
    fn eq(&self, other: &Word) -> bool {
        self.0 == other.0
    }
}

/// The kind of failure a Cap'n Proto operation experienced. Mirrors the
/// distinction the RPC layer makes between transient and permanent
/// failures, even though this crate never produces anything but `Failed`
/// on its own — generated code and higher layers may construct the other
/// variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Something went wrong. This is the only kind of error produced by
    /// this crate's own accessors (malformed pointers, out-of-bounds
    /// slices, and so on) -- it corresponds to `InvalidMessage` in the
    /// design documentation.
    Failed,
    /// The call failed because of a temporary lack of resources.
    Overloaded,
    /// The capability/connection was disconnected.
    Disconnected,
    /// The requested method is not implemented.
    Unimplemented,
}

/// The result of a failed Cap'n Proto operation.
#[derive(Clone)]
pub struct Error {
    kind: ErrorKind,
    #[cfg(feature = "alloc")]
    description: alloc::string::String,
    #[cfg(feature = "backtrace")]
    backtrace: alloc::string::String,
}

impl Error {
    #[cfg(feature = "alloc")]
    pub fn from_kind(kind: ErrorKind, description: impl Into<alloc::string::String>) -> Error {
        Error {
            kind,
            description: description.into(),
            #[cfg(feature = "backtrace")]
            backtrace: alloc::string::String::new(),
        }
    }

    /// Constructs a `Failed` error -- the kind returned for all structural
    /// message corruption detected by this crate.
    #[cfg(feature = "alloc")]
    pub fn failed(description: impl Into<alloc::string::String>) -> Error {
        Self::from_kind(ErrorKind::Failed, description)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[cfg(feature = "alloc")]
    pub fn description(&self) -> &str {
        &self.description
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        #[cfg(feature = "alloc")]
        {
            write!(f, "{:?}: {}", self.kind, self.description)
        }
        #[cfg(not(feature = "alloc"))]
        {
            write!(f, "{:?}", self.kind)
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// The result type used throughout this crate.
pub type Result<T> = core::result::Result<T, Error>;

/// The list of segments produced by a [message::Builder], ready to be
/// written out by [serialize::write_message_to_words] or packed with
/// [serialize_packed::pack].
#[cfg(feature = "alloc")]
pub type OutputSegments<'a> = smallvec::SmallVec<[&'a [u8]; 8]>;

/// Describes the size, in words, of a struct's data and pointer sections,
/// and whether that struct contains any pointers at all. Code generated by
/// `capnpc` uses this to tell the builder how much space a struct needs.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct MessageSize {
    pub word_count: u64,
    pub cap_count: u32,
}

impl core::ops::Add for MessageSize {
    type Output = MessageSize;
    fn add(self, other: MessageSize) -> MessageSize {
        MessageSize {
            word_count: self.word_count + other.word_count,
            cap_count: self.cap_count + other.cap_count,
        }
    }
}
