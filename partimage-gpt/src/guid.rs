use part::PartitionError;
use uuid::{uuid, Uuid};

/// Size of a binary GUID, in bytes
pub const GUID_SIZE: usize = 16;

const GUID_TEXT_LEN: usize = 36;

/// Standard EFI System Partition GUID. See the
/// [UAPI discoverable partition specification][uapi spec], [Partition Type Section][uapi gpt types]
/// for further details.
///
/// [uapi spec]: https://uapi-group.org/specifications/specs/discoverable_partitions_specification/
/// [uapi gpt types]: https://uapi-group.org/specifications/specs/discoverable_partitions_specification/#defined-partition-type-uuids
pub const EFI_SYSTEM_PART_GUID: Uuid = uuid!("c12a7328-f81f-11d2-ba4b-00a0c93ec93b");

/// Generic Linux Data Partition GUID
pub const LINUX_DATA_PART_GUID: Uuid = uuid!("0fc63daf-8483-4772-8e79-3d69d8477de4");

/// Converts a [`Uuid`] to its on-disk, mixed-endian, representation
#[must_use]
pub fn guid_bytes(uuid: &Uuid) -> [u8; GUID_SIZE] {
    let uuid_fields = uuid.as_fields();

    let mut uuid = [0; GUID_SIZE];
    uuid[0..4].copy_from_slice(&uuid_fields.0.to_le_bytes());
    uuid[4..6].copy_from_slice(&uuid_fields.1.to_le_bytes());
    uuid[6..8].copy_from_slice(&uuid_fields.2.to_le_bytes());
    uuid[8..].copy_from_slice(uuid_fields.3);

    uuid
}

/// Parses the textual form of a GUID into its on-disk representation.
///
/// The first three groups are stored byte-reversed, the last two in textual
/// order.
///
/// # Errors
///
/// Returns [`PartitionError::Format`] if the text isn't a 36 character,
/// dash-separated, GUID.
pub fn encode_guid(text: &str) -> Result<[u8; GUID_SIZE], PartitionError> {
    if text.len() != GUID_TEXT_LEN {
        return Err(PartitionError::Format(format!(
            "GUID {text:?} isn't {GUID_TEXT_LEN} characters long"
        )));
    }

    let uuid = Uuid::try_parse(text)
        .map_err(|err| PartitionError::Format(format!("Invalid GUID {text:?}: {err}")))?;

    Ok(uuid.to_bytes_le())
}

/// Formats an on-disk GUID into its canonical, upper-case, textual form
#[must_use]
pub fn decode_guid(bytes: &[u8; GUID_SIZE]) -> String {
    Uuid::from_bytes_le(*bytes)
        .hyphenated()
        .encode_upper(&mut Uuid::encode_buffer())
        .to_owned()
}
