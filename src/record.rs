//! Definition of fixed size types that can be moved through a ring buffer as bytes.

/// Fixed sized type with compile time known layout, size and alignment.
///
/// The basic idea is that this type provides support for zero-copy transmutation
/// between a record slice and byte slice. You probably don't want to handwrite these
/// yourself. There are crates that allows one to safely perform this transmutation.
pub trait Record: Sized {
    /// Size of the record.
    fn size() -> usize;

    /// Zero copy transmute from record slice to bytes.
    ///
    /// # Arguments
    ///
    /// * `records` - Record slice to transmute.
    fn to_bytes_slice(records: &[Self]) -> &[u8];

    /// Zero copy transmute from mutable record slice to mutable bytes.
    ///
    /// Any bit pattern written into returned bytes must be a valid record.
    ///
    /// # Arguments
    ///
    /// * `records` - Record slice to transmute.
    fn to_bytes_slice_mut(records: &mut [Self]) -> &mut [u8];
}

// There will be conflicting implementations if both features are enabled.
#[cfg(all(feature = "zerocopy", feature = "bytemuck"))]
compile_error!("Either zerocopy or bytemuck feature can to be enabled, not both");

// Support for zero copy transmutation for compatible types from bytemuck crate.
#[cfg(all(feature = "bytemuck", not(feature = "zerocopy")))]
use bytemuck::{AnyBitPattern, NoUninit, must_cast_slice, must_cast_slice_mut};

#[cfg(all(feature = "bytemuck", not(feature = "zerocopy")))]
impl<T: AnyBitPattern + NoUninit> Record for T {
    fn size() -> usize {
        size_of::<T>()
    }

    fn to_bytes_slice(records: &[Self]) -> &[u8] {
        must_cast_slice(records)
    }

    fn to_bytes_slice_mut(records: &mut [Self]) -> &mut [u8] {
        must_cast_slice_mut(records)
    }
}

// Support for zero copy transmutation for compatible types from zerocopy crate.
#[cfg(all(feature = "zerocopy", not(feature = "bytemuck")))]
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

#[cfg(all(feature = "zerocopy", not(feature = "bytemuck")))]
impl<T: FromBytes + IntoBytes + Immutable + KnownLayout> Record for T {
    fn size() -> usize {
        size_of::<T>()
    }

    fn to_bytes_slice(records: &[Self]) -> &[u8] {
        records.as_bytes()
    }

    fn to_bytes_slice_mut(records: &mut [Self]) -> &mut [u8] {
        records.as_mut_bytes()
    }
}


#[cfg(test)]
#[cfg(feature = "zerocopy")]
mod tests {
    use super::*;
    use bolero::{TypeGenerator, check};
    use zerocopy::FromZeros;

    #[repr(C)]
    #[derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        TypeGenerator,
        IntoBytes,
        FromBytes,
        KnownLayout,
        Immutable,
    )]
    struct Log {
        seq_no: u64,
        data: [u8; 16],
    }

    #[test]
    fn transmute_record_slice() {
        check!().with_type::<Vec<Log>>().for_each(|records| {
            // Transmute to bytes.
            let bytes = Log::to_bytes_slice(records);
            assert_eq!(Log::size() * records.len(), bytes.len());

            // Fill an empty slice of records through its bytes.
            let mut returned = vec![Log::new_zeroed(); records.len()];
            Log::to_bytes_slice_mut(&mut returned).copy_from_slice(bytes);
            assert_eq!(records, &returned);
        });
    }
}
