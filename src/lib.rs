pub mod acl;
pub mod config;
pub mod directory;
pub mod dn;
pub mod ldap_protocol;
pub mod metrics;
pub mod password;
pub mod server;
pub mod store;
pub mod tls;

pub use config::Config;
pub use directory::Directory;
pub use metrics::{Metrics, run_metrics_server};
pub use server::{Handler, LdapServer};
