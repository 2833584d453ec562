use kube::CustomResourceExt;
use leastpriv_types::*;
use std::fs;

fn main() {
    let _ = fs::create_dir("../crds");
    fs::write(
        "../crds/audit.leastpriv.io_auditsource_crd.yaml",
        serde_yaml::to_string(&AuditSource::crd()).unwrap(),
    )
    .unwrap();
    fs::write(
        "../crds/audit.leastpriv.io_rbacreport_crd.yaml",
        serde_yaml::to_string(&RbacReport::crd()).unwrap(),
    )
    .unwrap();
}
