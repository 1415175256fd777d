// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License (see Cargo.toml).

//! Multi-segment message framing (the segment table that precedes a
//! message's payload on the wire).
//!
//! This module only computes and parses that header and lays segments out
//! contiguously in memory; turning a byte stream into the `&[Word]` this
//! module expects (buffering, async reads, flushing) is left to callers.

use alloc::string::ToString;
use alloc::vec::Vec;

use crate::message::{self, ReaderOptions, ReaderSegments};
use crate::private::units::BYTES_PER_WORD;
use crate::{Error, Result, Word};

/// Segment tables with more entries than this are rejected outright, as a
/// guard against a corrupt or adversarial header driving an enormous
/// upfront allocation.
pub const MAX_SEGMENTS: usize = 1 << 20;

/// The number of words occupied by a segment table with `segment_count`
/// entries: a `u32` segment count, one `u32` length per segment, padded up
/// to a whole number of words.
pub fn segment_table_words(segment_count: usize) -> usize {
    (segment_count + 2) / 2
}

/// Computes the total word count of the segment table plus all segment
/// payloads -- the size of the buffer [write_message_segments] will fill.
pub fn compute_serialized_size_in_words(segments: &[&[u8]]) -> usize {
    let payload_words: usize = segments.iter().map(|s| s.len() / BYTES_PER_WORD).sum();
    segment_table_words(segments.len()) + payload_words
}

/// Writes the segment table followed by the segments themselves, in order,
/// appending to `out`.
pub fn write_message_segments(out: &mut Vec<Word>, segments: &[&[u8]]) {
    assert!(!segments.is_empty(), "a message always has at least one segment");
    let header_words = segment_table_words(segments.len());
    let start = out.len();
    out.resize(start + header_words, Word::NULL);
    {
        let header_bytes = Word::words_to_bytes_mut(&mut out[start..]);
        header_bytes[0..4].copy_from_slice(&((segments.len() - 1) as u32).to_le_bytes());
        for (i, segment) in segments.iter().enumerate() {
            let word_count = (segment.len() / BYTES_PER_WORD) as u32;
            let offset = 4 + i * 4;
            header_bytes[offset..offset + 4].copy_from_slice(&word_count.to_le_bytes());
        }
    }
    for segment in segments {
        out.extend_from_slice(Word::bytes_to_words(segment));
    }
}

/// Serializes a builder's segments to a freshly allocated word buffer.
pub fn write_message_to_words<A: message::Allocator>(message: &message::Builder<A>) -> Vec<Word> {
    let segments = message.get_segments_for_output();
    let mut out = Vec::with_capacity(compute_serialized_size_in_words(&segments[..]));
    write_message_segments(&mut out, &segments[..]);
    out
}

/// Owns the per-segment byte slices sliced out of a flat in-memory message
/// by [read_message_from_words].
pub struct FlatSegments<'a> {
    segments: Vec<&'a [u8]>,
}

impl<'a> ReaderSegments for FlatSegments<'a> {
    fn get_segment(&self, id: u32) -> Option<&[u8]> {
        self.segments.get(id as usize).copied()
    }

    fn len(&self) -> usize {
        self.segments.len()
    }
}

/// Parses a segment table followed by its payload out of `words`, and
/// returns a message reader over the resulting segments. `words` must
/// contain exactly the framed message -- no leading or trailing data.
pub fn read_message_from_words(words: &[Word], options: ReaderOptions) -> Result<message::Reader<FlatSegments<'_>>> {
    if words.is_empty() {
        return Err(Error::failed("message ends prematurely in segment table".to_string()));
    }
    let header_bytes = Word::words_to_bytes(words);
    let segment_count = u32::from_le_bytes(header_bytes[0..4].try_into().unwrap()) as usize + 1;
    if segment_count > MAX_SEGMENTS {
        return Err(Error::failed("too many segments".to_string()));
    }
    let header_words = segment_table_words(segment_count);
    if words.len() < header_words {
        return Err(Error::failed("message ends prematurely in segment table".to_string()));
    }

    let mut segment_word_counts = Vec::with_capacity(segment_count);
    for i in 0..segment_count {
        let offset = 4 + i * 4;
        let word_count = u32::from_le_bytes(header_bytes[offset..offset + 4].try_into().unwrap()) as usize;
        segment_word_counts.push(word_count);
    }

    let mut segments = Vec::with_capacity(segment_count);
    let mut cursor = header_words;
    for word_count in segment_word_counts {
        let end = cursor
            .checked_add(word_count)
            .ok_or_else(|| Error::failed("segment table overflow".to_string()))?;
        if end > words.len() {
            return Err(Error::failed("message ends prematurely in segment payload".to_string()));
        }
        segments.push(Word::words_to_bytes(&words[cursor..end]));
        cursor = end;
    }

    Ok(message::Reader::new(FlatSegments { segments }, options))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DEFAULT_READER_OPTIONS;

    #[test]
    fn round_trips_a_two_segment_table() {
        let segment_a = [Word::NULL, Word::NULL];
        let segment_b = [Word::NULL];
        let segment_a_bytes = Word::words_to_bytes(&segment_a);
        let segment_b_bytes = Word::words_to_bytes(&segment_b);
        let segments: [&[u8]; 2] = [segment_a_bytes, segment_b_bytes];

        let mut words = Vec::new();
        write_message_segments(&mut words, &segments);
        assert_eq!(words.len(), compute_serialized_size_in_words(&segments));

        let reader = read_message_from_words(&words, DEFAULT_READER_OPTIONS).unwrap();
        assert_eq!(reader.into_segments().len(), 2);
    }

    #[test]
    fn rejects_a_truncated_segment_table() {
        // Claims 3 segments (count - 1 == 2) but supplies no length words.
        let mut word = Word::NULL;
        word.bytes_mut()[0..4].copy_from_slice(&2_u32.to_le_bytes());
        let err = read_message_from_words(core::slice::from_ref(&word), DEFAULT_READER_OPTIONS);
        assert!(err.is_err());
    }
}
