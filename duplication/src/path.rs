use time::OffsetDateTime;

/// Where a replica keeps a file: partitioned by storage, the secondary id
/// of the disk node for that storage and the hour the file was created in.
///
/// `/{storage}/{second_id}/{yyyy}/{MM}/{dd}/{HH}/{name}`
pub struct FilePathBuilder;

impl FilePathBuilder {
    /// `create_time` is in milliseconds since the unix epoch, times outside
    /// the supported range end up in the epoch directory
    pub fn build_file_path(storage: &str, second_id: &str, create_time: i64, name: &str) -> String {
        let nanos = i128::from(create_time) * 1_000_000;
        let created =
            OffsetDateTime::from_unix_timestamp_nanos(nanos).unwrap_or(OffsetDateTime::UNIX_EPOCH);
        format!(
            "/{storage}/{second_id}/{:04}/{:02}/{:02}/{:02}/{name}",
            created.year(),
            u8::from(created.month()),
            created.day(),
            created.hour(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitioned_by_hour() {
        // 2023-02-01 13:45:10.250 UTC
        let created = 1_675_259_110_250;
        let path = FilePathBuilder::build_file_path("logs", "21", created, "f_3");
        assert_eq!(path, "/logs/21/2023/02/01/13/f_3");
    }

    #[test]
    fn out_of_range_time() {
        let path = FilePathBuilder::build_file_path("logs", "21", i64::MAX, "f");
        assert_eq!(path, "/logs/21/1970/01/01/00/f");
    }
}
