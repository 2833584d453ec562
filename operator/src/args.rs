use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "leastpriv-operator")]
pub struct Args {
    /// Namespace holding the leader-election Lease. This keeps RBAC
    /// namespaced rather than cluster-scoped.
    #[arg(long, env = "NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Lease name shared by all replicas
    #[arg(long, env = "LEASE_NAME", default_value = "leastpriv-operator-lock")]
    pub lease_name: String,

    /// Unique identity for this replica (Downward API POD_NAME is ideal)
    #[arg(long, env = "POD_NAME")]
    pub pod_name: Option<String>,
}
