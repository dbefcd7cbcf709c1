//! Integration tests for the remote project filesystem.
//!
//! These tests drive `VirtualFilesystem` over the in-memory file channel:
//! - Recursive create, remove and size
//! - Timestamp unit conversion at the driver boundary
//! - Error kinds handed to the driver

use std::sync::Arc;

use dojo_bridge::vfs::{FsError, FsOperations, MemoryFileChannel, TimeUnit, VirtualFilesystem};

fn filesystem(channel: MemoryFileChannel, unit: TimeUnit) -> VirtualFilesystem {
    VirtualFilesystem::new(Arc::new(channel), unit)
}

// =============================================================================
// Recursive Operations
// =============================================================================

mod recursive {
    use super::*;

    #[tokio::test]
    async fn test_makedirs_is_idempotent() {
        let fs = filesystem(MemoryFileChannel::new(), TimeUnit::Seconds);

        fs.makedirs("a/b/c").await.expect("first makedirs");
        let before = fs.list("a/b").await.expect("list after first call");
        fs.makedirs("a/b/c").await.expect("second makedirs");
        let after = fs.list("a/b").await.expect("list after second call");

        assert_eq!(before, after);
        assert_eq!(after, vec!["c"]);
        assert!(fs.is_dir("a/b/c").await.expect("is_dir"));
    }

    #[tokio::test]
    async fn test_makedirs_keeps_existing_contents() {
        let fs = filesystem(
            MemoryFileChannel::new().with_file("work/notes.txt", b"keep me"),
            TimeUnit::Seconds,
        );

        fs.makedirs("work/build/out").await.expect("makedirs");

        assert_eq!(
            fs.read_bytes("work/notes.txt").await.expect("read notes"),
            b"keep me"
        );
        assert_eq!(
            fs.list("work").await.expect("list work"),
            vec!["build", "notes.txt"]
        );
    }

    #[tokio::test]
    async fn test_remove_recursive_empties_tree() {
        let channel = MemoryFileChannel::new()
            .with_file("tree/top.txt", b"1")
            .with_file("tree/nested/deeper/leaf.bin", b"22")
            .with_dir("tree/empty")
            .with_symlink("tree/loop", ".");
        let fs = filesystem(channel, TimeUnit::Seconds);

        fs.remove_recursive("tree").await.expect("remove tree");

        assert!(!fs.is_dir("tree").await.expect("is_dir"));
        assert!(!fs.is_file("tree").await.expect("is_file"));
        assert!(matches!(fs.list("tree").await, Err(FsError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_remove_recursive_plain_file_and_missing_path() {
        let fs = filesystem(
            MemoryFileChannel::new().with_file("single", b"x"),
            TimeUnit::Seconds,
        );

        fs.remove_recursive("single").await.expect("remove file");
        assert!(!fs.is_file("single").await.expect("is_file"));
        fs.remove_recursive("never-existed")
            .await
            .expect("missing path is not an error");
    }

    #[tokio::test]
    async fn test_remove_recursive_does_not_follow_directory_links() {
        let channel = MemoryFileChannel::new()
            .with_file("keep/important", b"data")
            .with_symlink("scratch/link", "../keep");
        let fs = filesystem(channel, TimeUnit::Seconds);

        fs.remove_recursive("scratch").await.expect("remove scratch");

        assert!(fs.is_file("keep/important").await.expect("is_file"));
    }

    #[tokio::test]
    async fn test_size_of_sums_nested_entries() {
        let channel = MemoryFileChannel::new()
            .with_file("dir/ten", &[0; 10])
            .with_file("dir/twenty", &[0; 20])
            .with_file("dir/thirty", &[0; 30])
            .with_file("dir/sub/five", &[0; 5]);
        let fs = filesystem(channel, TimeUnit::Seconds);

        assert_eq!(fs.size_of("dir").await.expect("size of dir"), 65);
        assert_eq!(fs.size_of("dir/twenty").await.expect("size of file"), 20);
        assert_eq!(fs.size_of("dir/missing").await.expect("size of missing"), -1);
    }
}

// =============================================================================
// Timestamps
// =============================================================================

mod timestamps {
    use super::*;

    #[tokio::test]
    async fn test_seconds_round_trip_exactly() {
        let fs = filesystem(MemoryFileChannel::new().with_file("f", b""), TimeUnit::Seconds);
        let t = 1_700_000_123;

        fs.utimens("f", Some((t, t))).await.expect("utimens");
        let attrs = fs.getattr("f").await.expect("getattr");

        assert_eq!(attrs.mtime, t);
        assert_eq!(attrs.atime, t);
    }

    #[tokio::test]
    async fn test_nanoseconds_drop_sub_second_remainder() {
        let fs = filesystem(
            MemoryFileChannel::new().with_file("f", b""),
            TimeUnit::Nanoseconds,
        );
        let t = 1_700_000_123u64;
        let r = 987_654_321u64;

        fs.utimens("f", Some((t * 1_000_000_000, t * 1_000_000_000 + r)))
            .await
            .expect("utimens");
        let attrs = fs.getattr("f").await.expect("getattr");

        assert_eq!(attrs.mtime, t * 1_000_000_000);
        assert_eq!(attrs.atime, t * 1_000_000_000);
    }
}

// =============================================================================
// Driver-Facing Errors
// =============================================================================

mod errors {
    use super::*;

    #[tokio::test]
    async fn test_missing_path_maps_to_enoent() {
        let fs = filesystem(MemoryFileChannel::new(), TimeUnit::Seconds);
        let err = fs.getattr("ghost").await.expect_err("should be missing");
        assert_eq!(err.errno(), libc::ENOENT);
    }

    #[tokio::test]
    async fn test_denied_path_maps_to_eacces() {
        let fs = filesystem(
            MemoryFileChannel::new().with_file("flag", b"pwn{x}").deny("flag"),
            TimeUnit::Seconds,
        );
        let err = fs.read("flag", 16, 0).await.expect_err("should be denied");
        assert!(matches!(err, FsError::PermissionDenied(_)));
        assert_eq!(err.errno(), libc::EACCES);
    }

    #[tokio::test]
    async fn test_rmdir_non_empty_is_io_error() {
        let fs = filesystem(
            MemoryFileChannel::new().with_file("d/f", b""),
            TimeUnit::Seconds,
        );
        let err = fs.rmdir("d").await.expect_err("non-empty");
        assert_eq!(err.errno(), libc::EIO);
    }
}
