//! ROI planning and hashing for one run.
//!
//! Forward pass: full input size through every `modify_roi_out`, giving the
//! processed size. Backward pass: requested output ROI through every
//! `modify_roi_in`, giving each node's ROIs and the input stage's ROI. Hash
//! pass: head to tail, chaining each node's committed parameter hash with its
//! planned ROIs.

use common::djb2::DJB2_SEED;

use crate::module::OperationTags;
use crate::node::{mix, Node};
use crate::roi::Roi;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plan {
    pub output_roi: Roi,
    /// ROI the input stage has to deliver.
    pub base_roi: Roi,
    pub base_hash: u64,
    /// Full output size at scale 1.
    pub processed_size: (usize, usize),
    /// Hash of the last active node's output.
    pub tail_hash: u64,
}

pub(crate) struct PlanInputs<'a> {
    pub image_id: u64,
    pub source_dims: (usize, usize),
    pub output_roi: Roi,
    pub mask_display: bool,
    /// Module being edited, whose tag filter hides later operations.
    pub active_module: Option<&'a str>,
}

pub(crate) fn plan(nodes: &mut [Node], inputs: &PlanInputs<'_>) -> Plan {
    activate(nodes, inputs.active_module);
    let processed_size = forward(nodes, inputs.source_dims);
    let base_roi = backward(nodes, inputs.output_roi);
    let base_hash = base_hash(inputs.image_id, inputs.source_dims, &base_roi);
    let tail_hash = hash_chain(nodes, base_hash, inputs.mask_display);

    Plan {
        output_roi: inputs.output_roi,
        base_roi,
        base_hash,
        processed_size,
        tail_hash,
    }
}

fn activate(nodes: &mut [Node], active_module: Option<&str>) {
    let mut filter = OperationTags::empty();
    for node in nodes.iter_mut() {
        let filtered = node.module().operation_tags().intersects(filter);
        if filtered && node.is_enabled() {
            tracing::trace!("[dev_pixelpipe] {} hidden while another module is edited", node.name());
        }
        node.active = node.is_enabled() && !filtered;
        if Some(node.name()) == active_module {
            filter = node.module().operation_tags_filter();
        }
    }
}

fn forward(nodes: &[Node], (width, height): (usize, usize)) -> (usize, usize) {
    let roi = nodes
        .iter()
        .filter(|node| node.active)
        .fold(Roi::full(width, height), |roi, node| {
            node.module().modify_roi_out(node.params(), &roi)
        });
    (roi.width, roi.height)
}

fn backward(nodes: &mut [Node], output_roi: Roi) -> Roi {
    let mut roi = output_roi;
    for node in nodes.iter_mut().rev() {
        node.roi_out = roi;
        if node.active {
            roi = node.module().modify_roi_in(node.params(), &roi);
        }
        node.roi_in = roi;
    }
    roi
}

pub(crate) fn base_hash(image_id: u64, source_dims: (usize, usize), base_roi: &Roi) -> u64 {
    let hash = mix(DJB2_SEED, &image_id);
    let hash = mix(hash, &(source_dims.0 as u64, source_dims.1 as u64));
    mix(hash, base_roi)
}

fn hash_chain(nodes: &mut [Node], base_hash: u64, mask_display: bool) -> u64 {
    let mut hash = base_hash;
    let mut distortion = base_hash;
    let mut bypass = false;

    for node in nodes.iter_mut() {
        if node.active {
            bypass |= node.bypass_cache();
            hash = mix(
                hash,
                &(node.params_hash(), node.roi_in, node.roi_out, mask_display, bypass),
            );
            if node.module().is_distorting() {
                distortion = mix(distortion, &(node.params_hash(), node.roi_out));
            }
        }
        node.global_hash = hash;
        node.global_mask_hash = mix(distortion, &node.blend_hash());
        node.bypass = bypass;
    }
    hash
}
