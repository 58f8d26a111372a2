use crate::error::FatalError;

/// Physical range covered by the root of the tree.
pub const ROOT_START: u64 = 0x0000_0000_0000_0000;
pub const ROOT_END: u64 = 0x0000_007F_FFFF_FFFF;

/// Width of a single bus access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessSize {
    Byte,
    Half,
    Word,
    Double,
}

impl AccessSize {
    pub fn from_bytes(addr: u64, size: usize) -> Result<Self, FatalError> {
        match size {
            1 => Ok(AccessSize::Byte),
            2 => Ok(AccessSize::Half),
            4 => Ok(AccessSize::Word),
            8 => Ok(AccessSize::Double),
            _ => Err(FatalError::BadAccessSize { addr, size }),
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            AccessSize::Byte => 1,
            AccessSize::Half => 2,
            AccessSize::Word => 4,
            AccessSize::Double => 8,
        }
    }

    pub fn mask(self) -> u64 {
        match self {
            AccessSize::Double => u64::MAX,
            other => (1u64 << (other.bytes() * 8)) - 1,
        }
    }

    /// Sign-extend the low `self.bytes()` bytes of `value` to 64 bits.
    pub fn sign_extend(self, value: u64) -> u64 {
        let shift = 64 - self.bytes() * 8;
        (((value << shift) as i64) >> shift) as u64
    }
}

/// Read-modify-write tag carried alongside an access.
///
/// Plain loads and stores use `None`. Atomics pass their operation so the
/// device computes `new = f(old, data)` under a single access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rmw {
    #[default]
    None,
    LrSc,
    Swap,
    Add,
    Xor,
    Or,
    And,
    Min,
    Max,
    MinU,
    MaxU,
}

impl Rmw {
    /// Value to store given the value currently held at the target.
    pub fn apply(self, old: u64, data: u64, size: AccessSize) -> u64 {
        let new = match self {
            Rmw::None | Rmw::LrSc | Rmw::Swap => data,
            Rmw::Add => old.wrapping_add(data),
            Rmw::Xor => old ^ data,
            Rmw::Or => old | data,
            Rmw::And => old & data,
            Rmw::Min | Rmw::Max => {
                let a = size.sign_extend(old) as i64;
                let b = size.sign_extend(data) as i64;
                let pick_old = if self == Rmw::Min { a < b } else { a > b };
                if pick_old {
                    old
                } else {
                    data
                }
            }
            Rmw::MinU | Rmw::MaxU => {
                let a = old & size.mask();
                let b = data & size.mask();
                let pick_old = if self == Rmw::MinU { a < b } else { a > b };
                if pick_old {
                    old
                } else {
                    data
                }
            }
        };
        new & size.mask()
    }
}

/// A leaf handler in the address-space tree.
///
/// `addr` is relative to the start of the node the device is attached to.
/// `write` returns the value held before the write; devices with no
/// meaningful previous value return 0.
pub trait Device {
    fn read(&mut self, addr: u64, size: AccessSize, rmw: Rmw) -> Result<u64, FatalError>;
    fn write(&mut self, addr: u64, size: AccessSize, data: u64, rmw: Rmw)
        -> Result<u64, FatalError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(usize);

pub struct Node {
    pub name: String,
    pub start: u64,
    pub end: u64,
    device: Option<Box<dyn Device>>,
    children: Vec<NodeId>,
}

impl Node {
    fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr <= self.end
    }
}

/// Tree of physical address ranges.
///
/// Nodes live in an arena and refer to their children by index. A lookup
/// walks down from a node, taking the first child (in registration order)
/// whose inclusive `[start, end]` range holds the address and rebasing the
/// address onto that child. When no child matches, the node's own device
/// handles the access. Children are expected to be disjoint and inside their
/// parent; that is not checked.
pub struct AddressSpace {
    nodes: Vec<Node>,
}

impl AddressSpace {
    pub const ROOT: NodeId = NodeId(0);

    pub fn new(start: u64, end: u64) -> Self {
        let root = Node {
            name: "root".to_string(),
            start,
            end,
            device: None,
            children: Vec::new(),
        };
        Self { nodes: vec![root] }
    }

    /// Create a detached node. It takes part in dispatch once registered.
    pub fn create(
        &mut self,
        name: &str,
        start: u64,
        end: u64,
        device: Option<Box<dyn Device>>,
    ) -> NodeId {
        self.nodes.push(Node {
            name: name.to_string(),
            start,
            end,
            device,
            children: Vec::new(),
        });
        NodeId(self.nodes.len() - 1)
    }

    pub fn register(&mut self, parent: NodeId, child: NodeId) {
        log::debug!(
            "address space: {} [{:#x}..={:#x}] under {}",
            self.nodes[child.0].name,
            self.nodes[child.0].start,
            self.nodes[child.0].end,
            self.nodes[parent.0].name
        );
        self.nodes[parent.0].children.push(child);
    }

    /// Create a node for `device` and register it under `parent`.
    pub fn attach<D: Device + 'static>(
        &mut self,
        parent: NodeId,
        name: &str,
        start: u64,
        end: u64,
        device: D,
    ) -> NodeId {
        let id = self.create(name, start, end, Some(Box::new(device)));
        self.register(parent, id);
        id
    }

    pub fn set_device(&mut self, node: NodeId, device: Box<dyn Device>) {
        self.nodes[node.0].device = Some(device);
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    /// Walk down from `node` to the deepest node claiming `addr`.
    fn resolve(&self, node: NodeId, addr: u64) -> (NodeId, u64) {
        let mut current = node;
        let mut offset = addr;
        'descend: loop {
            for &child in &self.nodes[current.0].children {
                let c = &self.nodes[child.0];
                if c.contains(offset) {
                    offset -= c.start;
                    current = child;
                    continue 'descend;
                }
            }
            return (current, offset);
        }
    }

    pub fn read_node(
        &mut self,
        node: NodeId,
        addr: u64,
        size: AccessSize,
        rmw: Rmw,
    ) -> Result<u64, FatalError> {
        let (leaf, offset) = self.resolve(node, addr);
        match self.nodes[leaf.0].device.as_mut() {
            Some(dev) => dev.read(offset, size, rmw),
            None => Err(FatalError::Unmapped {
                addr,
                size: size.bytes(),
                op: "read",
            }),
        }
    }

    pub fn write_node(
        &mut self,
        node: NodeId,
        addr: u64,
        size: AccessSize,
        data: u64,
        rmw: Rmw,
    ) -> Result<u64, FatalError> {
        let (leaf, offset) = self.resolve(node, addr);
        match self.nodes[leaf.0].device.as_mut() {
            Some(dev) => dev.write(offset, size, data & size.mask(), rmw),
            None => Err(FatalError::Unmapped {
                addr,
                size: size.bytes(),
                op: "write",
            }),
        }
    }

    /// Physical read from the root, bypassing translation.
    pub fn read(&mut self, addr: u64, size: AccessSize, rmw: Rmw) -> Result<u64, FatalError> {
        self.check_root(addr, size, "read")?;
        self.read_node(Self::ROOT, addr, size, rmw)
    }

    /// Physical write from the root, bypassing translation. Returns the
    /// previous value.
    pub fn write(
        &mut self,
        addr: u64,
        size: AccessSize,
        data: u64,
        rmw: Rmw,
    ) -> Result<u64, FatalError> {
        self.check_root(addr, size, "write")?;
        self.write_node(Self::ROOT, addr, size, data, rmw)
    }

    fn check_root(&self, addr: u64, size: AccessSize, op: &'static str) -> Result<(), FatalError> {
        if self.nodes[0].contains(addr) {
            Ok(())
        } else {
            Err(FatalError::Unmapped {
                addr,
                size: size.bytes(),
                op,
            })
        }
    }

    /// Copy `buf.len()` bytes out of physical memory, using 8-byte accesses
    /// where aligned and single bytes elsewhere.
    pub fn read_blob(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), FatalError> {
        let mut off = 0;
        while off < buf.len() {
            let cur = addr + off as u64;
            let size = blob_chunk(cur, buf.len() - off);
            let n = size.bytes();
            let value = self.read(cur, size, Rmw::None)?;
            buf[off..off + n].copy_from_slice(&value.to_le_bytes()[..n]);
            off += n;
        }
        Ok(())
    }

    pub fn write_blob(&mut self, addr: u64, data: &[u8]) -> Result<(), FatalError> {
        let mut off = 0;
        while off < data.len() {
            let cur = addr + off as u64;
            let size = blob_chunk(cur, data.len() - off);
            let n = size.bytes();
            let mut bytes = [0u8; 8];
            bytes[..n].copy_from_slice(&data[off..off + n]);
            self.write(cur, size, u64::from_le_bytes(bytes), Rmw::None)?;
            off += n;
        }
        Ok(())
    }
}

fn blob_chunk(addr: u64, remaining: usize) -> AccessSize {
    if addr % 8 == 0 && remaining >= 8 {
        AccessSize::Double
    } else {
        AccessSize::Byte
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Ram;

    /// Answers every read with a fixed tag and remembers the last write.
    struct Tagged {
        tag: u64,
        last: Option<(u64, u64)>,
    }

    impl Device for Tagged {
        fn read(&mut self, addr: u64, _size: AccessSize, _rmw: Rmw) -> Result<u64, FatalError> {
            Ok(self.tag | addr)
        }

        fn write(
            &mut self,
            addr: u64,
            _size: AccessSize,
            data: u64,
            _rmw: Rmw,
        ) -> Result<u64, FatalError> {
            self.last = Some((addr, data));
            Ok(0)
        }
    }

    fn tagged(tag: u64) -> Tagged {
        Tagged { tag, last: None }
    }

    #[test]
    fn test_dispatch_to_children_and_parent() {
        let mut space = AddressSpace::new(ROOT_START, ROOT_END);
        let parent = space.attach(AddressSpace::ROOT, "parent", 0x1000, 0x1FFF, tagged(0xA000));
        space.attach(parent, "left", 0x100, 0x1FF, tagged(0xB000));
        space.attach(parent, "right", 0x200, 0x2FF, tagged(0xC000));

        // Child offsets are relative to the child's own start.
        assert_eq!(space.read(0x1104, AccessSize::Word, Rmw::None).unwrap(), 0xB004);
        assert_eq!(space.read(0x1208, AccessSize::Word, Rmw::None).unwrap(), 0xC008);
        // Not covered by a child: the parent device answers.
        assert_eq!(space.read(0x1010, AccessSize::Word, Rmw::None).unwrap(), 0xA010);
    }

    #[test]
    fn test_first_registered_child_wins() {
        let mut space = AddressSpace::new(ROOT_START, ROOT_END);
        space.attach(AddressSpace::ROOT, "first", 0x0, 0xFF, tagged(0x1000));
        space.attach(AddressSpace::ROOT, "second", 0x0, 0xFF, tagged(0x2000));
        assert_eq!(space.read(0x10, AccessSize::Byte, Rmw::None).unwrap(), 0x1010);
    }

    #[test]
    fn test_unmapped_address_is_fatal() {
        let mut space = AddressSpace::new(ROOT_START, ROOT_END);
        space.attach(AddressSpace::ROOT, "dev", 0x1000, 0x1FFF, tagged(0));
        match space.read(0x3000, AccessSize::Double, Rmw::None) {
            Err(FatalError::Unmapped { addr, size, op }) => {
                assert_eq!(addr, 0x3000);
                assert_eq!(size, 8);
                assert_eq!(op, "read");
            }
            other => panic!("expected unmapped error, got {:?}", other),
        }
        assert!(space.read(ROOT_END + 1, AccessSize::Byte, Rmw::None).is_err());
    }

    #[test]
    fn test_bad_access_size() {
        match AccessSize::from_bytes(0x80, 3) {
            Err(FatalError::BadAccessSize { addr, size }) => {
                assert_eq!(addr, 0x80);
                assert_eq!(size, 3);
            }
            other => panic!("expected bad size, got {:?}", other),
        }
    }

    #[test]
    fn test_detached_node_is_invisible_until_registered() {
        let mut space = AddressSpace::new(ROOT_START, ROOT_END);
        let node = space.create("late", 0x4000, 0x4FFF, Some(Box::new(tagged(0x5000))));
        assert!(space.read(0x4000, AccessSize::Byte, Rmw::None).is_err());
        space.register(AddressSpace::ROOT, node);
        assert_eq!(space.read(0x4001, AccessSize::Byte, Rmw::None).unwrap(), 0x5001);
    }

    #[test]
    fn test_blob_round_trip_unaligned() {
        let mut space = AddressSpace::new(ROOT_START, ROOT_END);
        space.attach(AddressSpace::ROOT, "ram", 0x8000_0000, 0x8000_0FFF, Ram::new(0x1000));

        let data: Vec<u8> = (0..29u8).collect();
        space.write_blob(0x8000_0003, &data).unwrap();
        let mut out = vec![0u8; data.len()];
        space.read_blob(0x8000_0003, &mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(
            space.read(0x8000_0008, AccessSize::Double, Rmw::None).unwrap(),
            u64::from_le_bytes([5, 6, 7, 8, 9, 10, 11, 12])
        );
    }

    #[test]
    fn test_rmw_apply() {
        let w = AccessSize::Word;
        assert_eq!(Rmw::Add.apply(0xFFFF_FFFF, 1, w), 0);
        assert_eq!(Rmw::Swap.apply(5, 9, AccessSize::Double), 9);
        // -1 < 1 signed, but 0xFFFF_FFFF > 1 unsigned.
        assert_eq!(Rmw::Min.apply(0xFFFF_FFFF, 1, w), 0xFFFF_FFFF);
        assert_eq!(Rmw::Max.apply(0xFFFF_FFFF, 1, w), 1);
        assert_eq!(Rmw::MinU.apply(0xFFFF_FFFF, 1, w), 1);
        assert_eq!(Rmw::MaxU.apply(0xFFFF_FFFF, 1, w), 0xFFFF_FFFF);
        assert_eq!(Rmw::And.apply(0b1100, 0b1010, w), 0b1000);
        assert_eq!(Rmw::Or.apply(0b1100, 0b1010, w), 0b1110);
        assert_eq!(Rmw::Xor.apply(0b1100, 0b1010, w), 0b0110);
    }

    #[test]
    fn test_write_truncates_to_access_width() {
        let mut space = AddressSpace::new(ROOT_START, ROOT_END);
        let id = space.attach(AddressSpace::ROOT, "ram", 0x2000, 0x2FFF, Ram::new(0x1000));
        space.write(0x2010, AccessSize::Word, 0xFFFF_FFFF, Rmw::None).unwrap();
        let old = space.write(0x2010, AccessSize::Half, 0x1_2345, Rmw::None).unwrap();
        assert_eq!(old, 0xFFFF);
        assert_eq!(space.node(id).name, "ram");
        assert_eq!(space.read(0x2010, AccessSize::Word, Rmw::None).unwrap(), 0xFFFF_2345);
    }
}
