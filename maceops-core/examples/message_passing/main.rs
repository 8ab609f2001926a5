use maceops_core::{
    DegreeLayout, Device, Graph, InvariantMessagePassing, KernelConfig, Tensor,
};
use std::time::Instant;

fn main() -> maceops_core::Result<()> {
    const NODES: usize = 512;
    const CHANNELS: usize = 32;
    const LMAX: usize = 2;

    // Ring with both neighbours and the node two steps back, sorted by receiver.
    let edges: Vec<(u32, u32)> = (0..NODES as u32)
        .flat_map(|n| {
            let prev = (n + NODES as u32 - 1) % NODES as u32;
            let next = (n + 1) % NODES as u32;
            let back = (n + NODES as u32 - 2) % NODES as u32;
            [(prev, n), (next, n), (back, n)]
        })
        .collect();
    let graph = Graph::from_edges(NODES, &edges)?;

    let device = Device::best(0);
    let layout = DegreeLayout::new(LMAX);
    let e = graph.nedges();
    let nodes = Tensor::<f32>::randn((NODES, CHANNELS), 0.0, 1.0, &device)?;
    let y = Tensor::<f32>::randn((e, layout.num_components()), 0.0, 1.0, &device)?;
    let r = Tensor::<f32>::randn((e, LMAX + 1, CHANNELS), 0.0, 1.0, &device)?;

    let config = KernelConfig::default().with_bucket_capacity(16);
    let tp = InvariantMessagePassing::with_config(layout, CHANNELS, config)?;
    let index = tp.sender_index(&graph)?;

    let start = Instant::now();
    let out = tp.forward_nodes(&nodes, &y, &r, &graph)?;
    println!("forward on {device:?}: {:?} in {:?}", out.dims(), start.elapsed());

    let g = Tensor::<f32>::ones(out.dims(), &device)?;
    let start = Instant::now();
    let grads = tp.backward_nodes(&nodes, &y, &r, &graph, &index, &g)?;
    println!(
        "backward: node grad {:?}, radial grad {:?} in {:?}",
        grads.node_feature.dims(),
        grads.edge_radial.dims(),
        start.elapsed()
    );
    Ok(())
}
