//! CRD YAML Generator
//!
//! Prints the manifests of every custom resource the operator serves.
//!
//! Usage: cargo run --bin crdgen > deploy/crds/all.yaml

use kube_declarative::crd::generate_crds;

fn main() -> anyhow::Result<()> {
    for crd in generate_crds()? {
        println!("---");
        print!("{}", crd);
    }
    Ok(())
}
