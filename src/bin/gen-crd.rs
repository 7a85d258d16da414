use dataplane_operator::crd::DataPlane;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    // Pipe through a YAML converter when a manifest is needed:
    // cargo run --bin gen-crd | yq -P
    let crd = serde_json::to_string_pretty(&DataPlane::crd())?;
    println!("{}", crd);
    Ok(())
}
