/// Property key holding the URI scheme of an announced service
pub const PROP_SERVICE_SCHEME: &str = "serviceScheme";
/// Property key holding the host or address of an announced service
pub const PROP_SERVICE_ADDRESS: &str = "serviceAddress";
/// Property key holding the port of an announced service
pub const PROP_SERVICE_PORT: &str = "servicePort";

/// Default root of the service discovery tree
pub const DEFAULT_ROOT: &str = "/ness/srvc";

/// Scheme of service discovery URIs
pub const SERVICE_URI_SCHEME: &str = "srvc";

/// Separator used to build announcement node names
pub const ANNOUNCEMENT_SEPARATOR: &str = "-";
