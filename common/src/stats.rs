use crate::resolve::FileOperation;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CopyStatItem {
    pub count: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl CopyStatItem {
    fn record(&mut self, bytes_in: u64, bytes_out: u64) {
        self.count += 1;
        self.bytes_in += bytes_in;
        self.bytes_out += bytes_out;
    }
}

impl std::ops::Add for CopyStatItem {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            count: self.count + other.count,
            bytes_in: self.bytes_in + other.bytes_in,
            bytes_out: self.bytes_out + other.bytes_out,
        }
    }
}

impl std::fmt::Display for CopyStatItem {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} files, {} in, {} out",
            self.count,
            bytesize::ByteSize(self.bytes_in),
            bytesize::ByteSize(self.bytes_out)
        )
    }
}

/// Per-category accounting of a copy batch.
///
/// `total` counts every file that was looked at (`copied + compressed + decompressed + skipped`),
/// `processed` only the ones whose bytes were transferred. Deleted sources are tracked on their
/// own and are not part of `total`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CopyStats {
    pub copied: CopyStatItem,
    pub compressed: CopyStatItem,
    pub decompressed: CopyStatItem,
    pub deleted: CopyStatItem,
    pub skipped: CopyStatItem,
    pub processed: CopyStatItem,
    pub total: CopyStatItem,
}

impl CopyStats {
    /// Accounts one finished `operation`.
    pub fn record(&mut self, operation: FileOperation, bytes_in: u64, bytes_out: u64) {
        match operation {
            FileOperation::Copy => self.copied.record(bytes_in, bytes_out),
            FileOperation::Compress => self.compressed.record(bytes_in, bytes_out),
            FileOperation::Decompress => self.decompressed.record(bytes_in, bytes_out),
            FileOperation::Skip => {
                self.skipped.record(bytes_in, bytes_out);
                self.total.record(bytes_in, bytes_out);
                return;
            }
            FileOperation::Delete => {
                self.deleted.record(bytes_in, bytes_out);
                return;
            }
        }
        self.processed.record(bytes_in, bytes_out);
        self.total.record(bytes_in, bytes_out);
    }
}

impl std::ops::Add for CopyStats {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            copied: self.copied + other.copied,
            compressed: self.compressed + other.compressed,
            decompressed: self.decompressed + other.decompressed,
            deleted: self.deleted + other.deleted,
            skipped: self.skipped + other.skipped,
            processed: self.processed + other.processed,
            total: self.total + other.total,
        }
    }
}

impl std::iter::Sum for CopyStats {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |acc, stats| acc + stats)
    }
}

impl std::fmt::Display for CopyStats {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "copied: {}\n\
            compressed: {}\n\
            decompressed: {}\n\
            skipped: {}\n\
            deleted: {}\n\
            processed: {}\n\
            total: {}\n",
            self.copied,
            self.compressed,
            self.decompressed,
            self.skipped,
            self.deleted,
            self.processed,
            self.total,
        )
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeleteStats {
    pub deleted: u64,
    pub skipped: u64,
}

impl std::ops::Add for DeleteStats {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            deleted: self.deleted + other.deleted,
            skipped: self.skipped + other.skipped,
        }
    }
}

impl std::iter::Sum for DeleteStats {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |acc, stats| acc + stats)
    }
}

impl std::fmt::Display for DeleteStats {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "deleted: {}\nskipped: {}\n", self.deleted, self.skipped)
    }
}
