//! RS-004: IPv4 CIDR parsing and sequential subnet allocation.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Smallest subnet AWS accepts inside a VPC.
pub const MAX_SUBNET_PREFIX: u8 = 28;

/// Largest VPC block AWS accepts.
pub const MIN_VPC_PREFIX: u8 = 16;

/// An IPv4 network block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    base: u32,
    prefix: u8,
}

impl Cidr {
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Number of addresses in the block.
    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix))
    }

    fn end(&self) -> u64 {
        u64::from(self.base) + self.size()
    }

    /// True if `other` lies entirely inside this block.
    pub fn contains(&self, other: &Cidr) -> bool {
        other.base >= self.base && other.end() <= self.end()
    }

    pub fn overlaps(&self, other: &Cidr) -> bool {
        u64::from(self.base) < other.end() && u64::from(other.base) < self.end()
    }
}

impl FromStr for Cidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("invalid CIDR '{}': missing prefix length", s))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|e| format!("invalid CIDR '{}': {}", s, e))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|e| format!("invalid CIDR '{}': {}", s, e))?;
        if prefix > 32 {
            return Err(format!("invalid CIDR '{}': prefix exceeds 32", s));
        }
        let base = u32::from(addr);
        let host_mask = if prefix == 0 { u32::MAX } else { (1u32 << (32 - prefix)) - 1 };
        if base & host_mask != 0 {
            return Err(format!("invalid CIDR '{}': host bits set", s));
        }
        Ok(Self { base, prefix })
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.base), self.prefix)
    }
}

/// Carves aligned subnets out of a VPC block, in request order.
#[derive(Debug, Clone)]
pub struct CidrAllocator {
    vpc: Cidr,
    next: u64,
}

impl CidrAllocator {
    pub fn new(vpc: Cidr) -> Self {
        Self {
            next: u64::from(vpc.base),
            vpc,
        }
    }

    /// Allocate the next free block with the given prefix length.
    pub fn allocate(&mut self, prefix: u8) -> Result<Cidr, String> {
        if prefix < self.vpc.prefix || prefix > MAX_SUBNET_PREFIX {
            return Err(format!(
                "subnet mask /{} must be between /{} and /{}",
                prefix, self.vpc.prefix, MAX_SUBNET_PREFIX
            ));
        }
        let size = 1u64 << (32 - u32::from(prefix));
        let start = self.next.div_ceil(size) * size;
        if start + size > self.vpc.end() {
            return Err(format!(
                "VPC {} has no room left for a /{} subnet",
                self.vpc, prefix
            ));
        }
        self.next = start + size;
        let base = u32::try_from(start).map_err(|_| "address overflow".to_string())?;
        Ok(Cidr { base, prefix })
    }
}
