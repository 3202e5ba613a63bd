//! Prints the CRD manifests for all agent custom resources as a YAML stream.

use crds::{Grant, User, Workspace};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let crds = [Workspace::crd(), User::crd(), Grant::crd()];
    for crd in &crds {
        println!("---");
        print!("{}", serde_yaml::to_string(crd)?);
    }
    Ok(())
}
