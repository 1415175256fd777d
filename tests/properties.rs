// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License (see Cargo.toml).

//! Property-based checks for the invariants the concrete scenarios in
//! `tests/roundtrip.rs` only sample at a few fixed points: packing
//! round-trips for arbitrary word sequences, the default-XOR identity for
//! arbitrary `(default, value)` pairs, and far-pointer transparency for
//! arbitrary initial segment sizes.

use quickcheck::quickcheck;

use capnp::any_pointer;
use capnp::message::{self, AllocationStrategy, HeapAllocator};
use capnp::private::layout::{PointerBuilder, PointerReader, StructBuilder, StructReader};
use capnp::serialize_packed::{pack, unpack};
use capnp::traits::{FromPointerBuilder, FromPointerReader};
use capnp::{Result, Word};

fn words_from_u64s(values: &[u64]) -> Vec<Word> {
    values
        .iter()
        .map(|&v| {
            let mut w = Word::NULL;
            w.bytes_mut().copy_from_slice(&v.to_le_bytes());
            w
        })
        .collect()
}

/// A one-data-word struct used only to drive `StructReader`/`StructBuilder`
/// through `any_pointer`, without a schema.
struct RawStruct<'a> {
    reader: StructReader<'a>,
}

impl<'a> FromPointerReader<'a> for RawStruct<'a> {
    fn get_from_pointer(reader: &PointerReader<'a>, default: Option<&'a [Word]>) -> Result<RawStruct<'a>> {
        Ok(RawStruct {
            reader: reader.get_struct(default)?,
        })
    }
}

struct RawStructBuilder<'a> {
    builder: StructBuilder<'a>,
}

impl<'a> FromPointerBuilder<'a> for RawStructBuilder<'a> {
    fn init_pointer(builder: PointerBuilder<'a>, _size: u32) -> Self {
        RawStructBuilder {
            builder: builder.init_struct(1, 0),
        }
    }

    fn get_from_pointer(builder: PointerBuilder<'a>, default: Option<&'a [Word]>) -> Result<Self> {
        Ok(RawStructBuilder {
            builder: builder.get_struct(1, 0, default)?,
        })
    }
}

quickcheck! {
    fn pack_unpack_round_trips(values: Vec<u64>) -> bool {
        let words = words_from_u64s(&values);
        let packed = pack(&words);
        match unpack(&packed) {
            Ok(unpacked) => {
                unpacked.len() == words.len()
                    && unpacked.iter().zip(words.iter()).all(|(a, b)| a.bytes() == b.bytes())
            }
            Err(_) => false,
        }
    }

    fn default_xor_round_trips(default: i32, value: i32) -> bool {
        let mut message = message::Builder::new_default();
        {
            let mut root: RawStructBuilder = message.init_root();
            root.builder.set_data_field_masked::<i32>(0, value, default);
        }
        let reader = message.into_reader();
        let root: RawStruct = reader.get_root().unwrap();
        root.reader.get_data_field_masked::<i32>(0, default) == value
    }

    fn unset_field_reads_as_its_default(default: i32) -> bool {
        let mut message = message::Builder::new_default();
        {
            let _root: RawStructBuilder = message.init_root();
        }
        let reader = message.into_reader();
        let root: RawStruct = reader.get_root().unwrap();
        root.reader.get_data_field_masked::<i32>(0, default) == default
    }

    fn far_pointer_is_transparent_at_any_initial_segment_size(first_segment_words: u8, value: i64) -> bool {
        let words = (first_segment_words % 20) as u32 + 1;
        let mut message = message::Builder::new(
            HeapAllocator::new()
                .first_segment_words(words)
                .allocation_strategy(AllocationStrategy::FixedSize),
        );
        {
            let root: any_pointer::Builder = message.init_root();
            let mut big = root.init_struct_as(13, 0);
            big.set_data_field::<i64>(0, value);
        }
        let reader = message.into_reader();
        let root: any_pointer::Reader = reader.get_root().unwrap();
        let s: RawStruct = root.get_as().unwrap();
        s.reader.get_data_field::<i64>(0) == value
    }
}
