mod cidr;
mod domain;

pub use cidr::CidrMatcher;
pub use domain::DomainMatcher;

pub(crate) use cidr::parse_net;
