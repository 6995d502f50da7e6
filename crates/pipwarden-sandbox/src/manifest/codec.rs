//! Binary manifest encoding handed to the interception backend.
//!
//! Layout (little-endian):
//!
//! ```text
//! "PWFM"  u16 version  u32 flags  u64 pip id  u16 default policy
//! u32 n   n × (str from, str to)                      directory translations
//! u32 n   n × (str tool, u8 has_args, [str args])     breakaway processes
//! node                                                policy tree, pre-order
//!
//! node := u8 present (1 = node policy, 2 = cone policy)
//!         [u16 node policy] [u16 cone policy]
//!         u32 n  n × (str segment, node)
//! str  := u32 byte length, UTF-8 bytes
//! ```
//!
//! The allowlist is evaluated engine-side and is not part of the encoding.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use pipwarden_types::{FileAccessPolicy, ManifestFlags, PipId};

use super::tree::PolicyNode;
use super::{BreakawayChildProcess, FileAccessManifest};
use crate::allowlist::FileAccessAllowlist;
use crate::error::{SandboxError, SandboxResult};
use crate::translator::DirectoryTranslator;

pub const MAGIC: &[u8; 4] = b"PWFM";
pub const VERSION: u16 = 1;

const HAS_NODE_POLICY: u8 = 0x1;
const HAS_CONE_POLICY: u8 = 0x2;
const MAX_DEPTH: usize = 1024;

pub(super) fn encode(manifest: &FileAccessManifest) -> Bytes {
    let mut buf = BytesMut::with_capacity(64 + manifest.root.node_count() * 16);
    buf.put_slice(MAGIC);
    buf.put_u16_le(VERSION);
    buf.put_u32_le(manifest.flags.bits());
    buf.put_u64_le(manifest.pip_id.value());
    buf.put_u16_le(manifest.default_policy.bits());

    let rules = manifest.translator.rules();
    buf.put_u32_le(rules.len() as u32);
    for (from, to) in rules {
        put_str(&mut buf, &from.to_string_lossy());
        put_str(&mut buf, &to.to_string_lossy());
    }

    buf.put_u32_le(manifest.breakaway.len() as u32);
    for entry in &manifest.breakaway {
        put_str(&mut buf, &entry.tool_name);
        match &entry.required_args {
            Some(args) => {
                buf.put_u8(1);
                put_str(&mut buf, args);
            }
            None => buf.put_u8(0),
        }
    }

    put_node(&mut buf, &manifest.root);
    buf.freeze()
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_node(buf: &mut BytesMut, node: &PolicyNode) {
    let mut present = 0;
    if node.node_policy.is_some() {
        present |= HAS_NODE_POLICY;
    }
    if node.cone_policy.is_some() {
        present |= HAS_CONE_POLICY;
    }
    buf.put_u8(present);
    if let Some(policy) = node.node_policy {
        buf.put_u16_le(policy.bits());
    }
    if let Some(policy) = node.cone_policy {
        buf.put_u16_le(policy.bits());
    }
    buf.put_u32_le(node.children.len() as u32);
    for (segment, child) in &node.children {
        put_str(buf, segment);
        put_node(buf, child);
    }
}

pub(super) fn decode(data: &[u8]) -> SandboxResult<FileAccessManifest> {
    let mut reader = Reader::new(data);

    let magic = reader.bytes(4, "magic")?;
    if magic != MAGIC {
        return Err(reader.error_at(0, "bad magic"));
    }
    let version = reader.u16("version")?;
    if version != VERSION {
        return Err(reader.error_at(4, &format!("unsupported version {version}")));
    }

    let flags = ManifestFlags::from_bits(reader.u32("flags")?);
    let pip_id = PipId::new(reader.u64("pip id")?);
    let default_policy = FileAccessPolicy::from_bits(reader.u16("default policy")?);

    let mut translator = DirectoryTranslator::new();
    for _ in 0..reader.u32("translation count")? {
        let offset = reader.offset();
        let from = reader.string("translation source")?;
        let to = reader.string("translation target")?;
        translator
            .add(PathBuf::from(from), PathBuf::from(to))
            .map_err(|e| reader.error_at(offset, &e.to_string()))?;
    }

    let mut breakaway = Vec::new();
    for _ in 0..reader.u32("breakaway count")? {
        let tool_name = reader.string("breakaway tool")?;
        let required_args = match reader.u8("breakaway args flag")? {
            0 => None,
            _ => Some(reader.string("breakaway args")?),
        };
        breakaway.push(BreakawayChildProcess {
            tool_name,
            required_args,
        });
    }

    let root = read_node(&mut reader, 0)?;
    if reader.buf.has_remaining() {
        return Err(reader.error("trailing bytes after policy tree"));
    }

    let mut manifest = FileAccessManifest {
        pip_id,
        flags,
        default_policy,
        root,
        translator,
        breakaway,
        allowlist: Arc::new(FileAccessAllowlist::default()),
        encoded: None,
    };
    manifest.encoded = Some(Bytes::copy_from_slice(data));
    Ok(manifest)
}

fn read_node(reader: &mut Reader<'_>, depth: usize) -> SandboxResult<PolicyNode> {
    if depth > MAX_DEPTH {
        return Err(reader.error("policy tree too deep"));
    }
    let present = reader.u8("node flags")?;
    if present & !(HAS_NODE_POLICY | HAS_CONE_POLICY) != 0 {
        return Err(reader.error(&format!("unknown node flags {present:#x}")));
    }
    let node_policy = if present & HAS_NODE_POLICY != 0 {
        Some(FileAccessPolicy::from_bits(reader.u16("node policy")?))
    } else {
        None
    };
    let cone_policy = if present & HAS_CONE_POLICY != 0 {
        Some(FileAccessPolicy::from_bits(reader.u16("cone policy")?))
    } else {
        None
    };

    let mut children = BTreeMap::new();
    for _ in 0..reader.u32("child count")? {
        let segment = reader.string("segment")?;
        let child = read_node(reader, depth + 1)?;
        children.insert(segment, child);
    }

    Ok(PolicyNode {
        node_policy,
        cone_policy,
        children,
    })
}

struct Reader<'a> {
    buf: &'a [u8],
    total: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            buf: data,
            total: data.len(),
        }
    }

    fn offset(&self) -> usize {
        self.total - self.buf.remaining()
    }

    fn error(&self, reason: &str) -> SandboxError {
        self.error_at(self.offset(), reason)
    }

    fn error_at(&self, offset: usize, reason: &str) -> SandboxError {
        SandboxError::ManifestDecode {
            offset,
            reason: reason.to_string(),
        }
    }

    fn need(&self, n: usize, what: &str) -> SandboxResult<()> {
        if self.buf.remaining() < n {
            return Err(self.error(&format!("truncated {what}")));
        }
        Ok(())
    }

    fn bytes(&mut self, n: usize, what: &str) -> SandboxResult<&'a [u8]> {
        self.need(n, what)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self, what: &str) -> SandboxResult<u8> {
        self.need(1, what)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self, what: &str) -> SandboxResult<u16> {
        self.need(2, what)?;
        Ok(self.buf.get_u16_le())
    }

    fn u32(&mut self, what: &str) -> SandboxResult<u32> {
        self.need(4, what)?;
        Ok(self.buf.get_u32_le())
    }

    fn u64(&mut self, what: &str) -> SandboxResult<u64> {
        self.need(8, what)?;
        Ok(self.buf.get_u64_le())
    }

    fn string(&mut self, what: &str) -> SandboxResult<String> {
        let len = self.u32(what)? as usize;
        let start = self.offset();
        let bytes = self.bytes(len, what)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| self.error_at(start, &format!("{what} is not UTF-8")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn manifest() -> FileAccessManifest {
        let mut manifest = FileAccessManifest::new(PipId::new(0x42));
        manifest
            .add_scope("/out", FileAccessPolicy::ALLOW_ALL)
            .unwrap();
        manifest
            .add_path("/src/a.c", FileAccessPolicy::ALLOW_READ)
            .unwrap();
        manifest.add_translation("/mnt/src", "/src").unwrap();
        manifest.add_breakaway("mspdbsrv", Some("-start")).unwrap();
        manifest
    }

    #[test]
    fn test_header_layout() {
        let mut manifest = manifest();
        let bytes = manifest.encode().unwrap();
        assert_eq!(&bytes[..4], b"PWFM");
        assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), VERSION);
        assert_eq!(
            u64::from_le_bytes(bytes[10..18].try_into().unwrap()),
            0x42
        );
    }

    #[test]
    fn test_decode_restores_policies() {
        let mut manifest = manifest();
        let bytes = manifest.encode().unwrap();
        let decoded = FileAccessManifest::decode(&bytes).unwrap();

        assert_eq!(decoded.pip_id(), PipId::new(0x42));
        assert_eq!(decoded.breakaway_processes(), manifest.breakaway_processes());
        assert_eq!(
            decoded.find_policy_for(Path::new("/out/x")),
            manifest.find_policy_for(Path::new("/out/x"))
        );
        assert_eq!(
            decoded.translator().translate(Path::new("/mnt/src/a.c")),
            PathBuf::from("/src/a.c")
        );
        assert!(decoded.is_sealed());
    }

    #[test]
    fn test_encoding_is_stable() {
        let mut a = manifest();
        let mut b = manifest();
        assert_eq!(a.encode().unwrap(), b.encode().unwrap());
        assert_eq!(a.encode().unwrap(), a.encode().unwrap());
    }

    #[test]
    fn test_rejects_bad_input() {
        let mut manifest = manifest();
        let bytes = manifest.encode().unwrap();

        let err = FileAccessManifest::decode(b"NOPE").unwrap_err();
        assert!(matches!(err, SandboxError::ManifestDecode { offset: 0, .. }));

        let mut wrong_version = bytes.to_vec();
        wrong_version[4] = 9;
        assert!(matches!(
            FileAccessManifest::decode(&wrong_version),
            Err(SandboxError::ManifestDecode { offset: 4, .. })
        ));

        let truncated = &bytes[..bytes.len() - 3];
        match FileAccessManifest::decode(truncated) {
            Err(SandboxError::ManifestDecode { offset, reason }) => {
                assert!(offset <= truncated.len());
                assert!(reason.contains("truncated"));
            }
            other => panic!("expected decode error, got {other:?}"),
        }

        let mut trailing = bytes.to_vec();
        trailing.push(0);
        assert!(FileAccessManifest::decode(&trailing).is_err());
    }
}
