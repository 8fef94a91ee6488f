//! Generic attribute layers.
//!
//! [`CustomData`] stores per-loop attribute layers on the coarse mesh.
//! [`GridAttributes`] mirrors those layers per grid point. Whenever a grid
//! creates a point by blending existing ones, the same weights are applied to
//! every attribute layer so arbitrary per-point data stays consistent with the
//! geometry.

use log::warn;

use crate::error::{MeshError, Result};

/// Kind of an attribute layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttrKind {
    /// A single scalar.
    Float,
    /// Texture coordinate.
    Uv,
    /// RGBA color.
    Color,
    /// Sculpt mask in `[0, 1]`.
    Mask,
}

impl AttrKind {
    /// Number of `f64` components per element.
    pub fn components(self) -> usize {
        match self {
            AttrKind::Float | AttrKind::Mask => 1,
            AttrKind::Uv => 2,
            AttrKind::Color => 4,
        }
    }

    /// Stable identifier used in persisted layouts.
    pub fn id(self) -> &'static str {
        match self {
            AttrKind::Float => "float",
            AttrKind::Uv => "uv",
            AttrKind::Color => "color",
            AttrKind::Mask => "mask",
        }
    }

    /// Parse a persisted identifier.
    ///
    /// Unknown identifiers fall back to [`AttrKind::Float`] so a layer from a newer
    /// file still loads.
    pub fn from_id(id: &str) -> Self {
        match id {
            "float" => AttrKind::Float,
            "uv" => AttrKind::Uv,
            "color" => AttrKind::Color,
            "mask" => AttrKind::Mask,
            other => {
                warn!("unknown attribute kind '{}', loading as float", other);
                AttrKind::Float
            }
        }
    }

    /// Value of a freshly created element.
    pub fn default_value(self) -> &'static [f64] {
        match self {
            AttrKind::Float => &[0.0],
            AttrKind::Uv => &[0.0, 0.0],
            AttrKind::Color => &[1.0, 1.0, 1.0, 1.0],
            AttrKind::Mask => &[1.0],
        }
    }

    fn normalizes_weights(self) -> bool {
        !matches!(self, AttrKind::Float)
    }
}

/// Weighted blend of `sources` into `out`.
fn blend<'a>(
    kind: AttrKind,
    out: &mut [f64],
    sources: impl Iterator<Item = &'a [f64]>,
    weights: &[f64],
) {
    let total: f64 = weights.iter().sum();
    let scale = if kind.normalizes_weights() && total.abs() > 1e-300 {
        1.0 / total
    } else {
        1.0
    };

    out.iter_mut().for_each(|c| *c = 0.0);
    for (src, &w) in sources.zip(weights) {
        for (c, s) in out.iter_mut().zip(src) {
            *c += s * w * scale;
        }
    }
}

/// A single attribute layer: `len * kind.components()` values.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    /// Attribute kind.
    pub kind: AttrKind,
    /// Display name.
    pub name: String,
    values: Vec<f64>,
}

impl Layer {
    fn new(kind: AttrKind, name: impl Into<String>, len: usize) -> Self {
        Self {
            kind,
            name: name.into(),
            values: kind.default_value().repeat(len),
        }
    }

    /// Values of one element.
    pub fn get(&self, elem: usize) -> &[f64] {
        let n = self.kind.components();
        &self.values[elem * n..(elem + 1) * n]
    }

    fn get_mut(&mut self, elem: usize) -> &mut [f64] {
        let n = self.kind.components();
        &mut self.values[elem * n..(elem + 1) * n]
    }

    /// Flat value storage.
    pub fn raw(&self) -> &[f64] {
        &self.values
    }
}

/// Attribute layers attached to mesh loops (one element per half-edge).
#[derive(Debug, Clone, Default)]
pub struct CustomData {
    layers: Vec<Layer>,
    len: usize,
}

impl CustomData {
    /// Create an empty layer set for `len` elements.
    pub fn new(len: usize) -> Self {
        Self {
            layers: Vec::new(),
            len,
        }
    }

    /// Number of elements per layer.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether there are no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// All layers in order.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Append a layer and return its index.
    pub fn add_layer(&mut self, kind: AttrKind, name: impl Into<String>) -> usize {
        self.layers.push(Layer::new(kind, name, self.len));
        self.layers.len() - 1
    }

    /// Index of the first layer of the given kind.
    pub fn layer_index(&self, kind: AttrKind) -> Option<usize> {
        self.layers.iter().position(|l| l.kind == kind)
    }

    /// Remove a layer. Later layers shift down by one.
    pub fn remove_layer(&mut self, index: usize) -> Result<Layer> {
        if index >= self.layers.len() {
            return Err(MeshError::invalid_param("layer", index, "no such layer"));
        }
        Ok(self.layers.remove(index))
    }

    /// Values of one element in one layer.
    pub fn values(&self, layer: usize, elem: usize) -> &[f64] {
        self.layers[layer].get(elem)
    }

    /// Overwrite one element in one layer.
    pub fn set(&mut self, layer: usize, elem: usize, value: &[f64]) {
        self.layers[layer].get_mut(elem).copy_from_slice(value);
    }

    /// Blend `sources` into `target` in every layer.
    pub fn interpolate(&mut self, target: usize, sources: &[usize], weights: &[f64]) {
        for layer in &mut self.layers {
            let mut out = vec![0.0; layer.kind.components()];
            blend(
                layer.kind,
                &mut out,
                sources.iter().map(|&s| layer.get(s)),
                weights,
            );
            layer.get_mut(target).copy_from_slice(&out);
        }
    }
}

/// One grid-side attribute array.
#[derive(Debug, Clone, PartialEq)]
pub struct GridLayer {
    /// Attribute kind.
    pub kind: AttrKind,
    values: Vec<f64>,
}

impl GridLayer {
    /// Values of one point.
    pub fn get(&self, point: usize) -> &[f64] {
        let n = self.kind.components();
        &self.values[point * n..(point + 1) * n]
    }

    /// Flat value storage.
    pub fn raw(&self) -> &[f64] {
        &self.values
    }
}

/// Per-point attribute arrays of a grid, linked to the mesh's [`CustomData`] layers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GridAttributes {
    layers: Vec<GridLayer>,
    /// Grid layer -> mesh layer index.
    links: Vec<Option<usize>>,
    len: usize,
}

impl GridAttributes {
    /// Mirror every layer of the mesh custom data, with no points yet.
    pub fn from_mesh(cd: &CustomData) -> Self {
        Self {
            layers: cd
                .layers()
                .iter()
                .map(|l| GridLayer {
                    kind: l.kind,
                    values: Vec::new(),
                })
                .collect(),
            links: (0..cd.layers().len()).map(Some).collect(),
            len: 0,
        }
    }

    /// Rebuild from persisted kinds and raw values. Layers start unlinked.
    pub fn from_layout(layout: &[String], values: Vec<Vec<f64>>, len: usize) -> Result<Self> {
        if layout.len() != values.len() {
            return Err(MeshError::Migration(format!(
                "{} layer kinds but {} value arrays",
                layout.len(),
                values.len()
            )));
        }
        let mut layers = Vec::with_capacity(layout.len());
        for (id, values) in layout.iter().zip(values) {
            let kind = AttrKind::from_id(id);
            if values.len() != len * kind.components() {
                return Err(MeshError::Migration(format!(
                    "layer '{}' has {} values for {} points",
                    id,
                    values.len(),
                    len
                )));
            }
            layers.push(GridLayer { kind, values });
        }
        Ok(Self {
            links: vec![None; layers.len()],
            layers,
            len,
        })
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether there are no points.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Grid layers in order.
    pub fn layers(&self) -> &[GridLayer] {
        &self.layers
    }

    /// Mesh layer each grid layer is linked to.
    pub fn links(&self) -> &[Option<usize>] {
        &self.links
    }

    /// Ordered kind identifiers, as persisted.
    pub fn layout(&self) -> Vec<String> {
        self.layers.iter().map(|l| l.kind.id().to_string()).collect()
    }

    /// Drop all points, keeping the layers.
    pub fn clear(&mut self) {
        for layer in &mut self.layers {
            layer.values.clear();
        }
        self.len = 0;
    }

    /// Append a point with default values and return its index.
    pub fn push_point(&mut self) -> usize {
        for layer in &mut self.layers {
            layer.values.extend_from_slice(layer.kind.default_value());
        }
        self.len += 1;
        self.len - 1
    }

    /// Values of one point in one layer.
    pub fn values(&self, layer: usize, point: usize) -> &[f64] {
        self.layers[layer].get(point)
    }

    /// Overwrite one point in one layer.
    pub fn set(&mut self, layer: usize, point: usize, value: &[f64]) {
        let n = self.layers[layer].kind.components();
        self.layers[layer].values[point * n..(point + 1) * n].copy_from_slice(value);
    }

    /// Blend other grid points into `target` in every layer.
    pub fn interpolate(&mut self, target: usize, sources: &[usize], weights: &[f64]) {
        for layer in &mut self.layers {
            let n = layer.kind.components();
            let mut out = vec![0.0; n];
            blend(
                layer.kind,
                &mut out,
                sources.iter().map(|&s| layer.get(s)),
                weights,
            );
            layer.values[target * n..(target + 1) * n].copy_from_slice(&out);
        }
    }

    /// Blend mesh loop values into grid point `target` in every linked layer.
    pub fn interpolate_from_mesh(
        &mut self,
        target: usize,
        cd: &CustomData,
        loops: &[usize],
        weights: &[f64],
    ) {
        for (layer, link) in self.layers.iter_mut().zip(&self.links) {
            let Some(mesh_layer) = link.and_then(|i| cd.layers().get(i)) else {
                continue;
            };
            if mesh_layer.kind != layer.kind {
                continue;
            }
            let n = layer.kind.components();
            let mut out = vec![0.0; n];
            blend(
                layer.kind,
                &mut out,
                loops.iter().map(|&l| mesh_layer.get(l)),
                weights,
            );
            layer.values[target * n..(target + 1) * n].copy_from_slice(&out);
        }
    }

    /// A layer was appended to the mesh custom data.
    pub fn on_new_layer(&mut self, kind: AttrKind, mesh_index: usize) {
        self.layers.push(GridLayer {
            kind,
            values: kind.default_value().repeat(self.len),
        });
        self.links.push(Some(mesh_index));
    }

    /// A mesh layer was removed; drop its mirror and shift later links down.
    pub fn on_remove_layer(&mut self, mesh_index: usize) {
        let mut i = 0;
        while i < self.layers.len() {
            match self.links[i] {
                Some(m) if m == mesh_index => {
                    self.layers.remove(i);
                    self.links.remove(i);
                    continue;
                }
                Some(m) if m > mesh_index => self.links[i] = Some(m - 1),
                _ => {}
            }
            i += 1;
        }
    }

    /// Re-associate grid layers with mesh layers after loading.
    ///
    /// Layers are matched by kind and occurrence order: the second `Uv` grid layer
    /// links to the second `Uv` mesh layer. The result follows the mesh layer order;
    /// unmatched grid layers are dropped and missing ones are filled with defaults.
    pub fn relink(&mut self, cd: &CustomData) {
        let kinds: Vec<AttrKind> = self.layers.iter().map(|l| l.kind).collect();
        let mut old: Vec<Option<GridLayer>> = self.layers.drain(..).map(Some).collect();

        let mut layers = Vec::with_capacity(cd.layers().len());
        for (mesh_index, mesh_layer) in cd.layers().iter().enumerate() {
            let occurrence = cd.layers()[..mesh_index]
                .iter()
                .filter(|l| l.kind == mesh_layer.kind)
                .count();

            let found = kinds
                .iter()
                .enumerate()
                .filter(|(_, &k)| k == mesh_layer.kind)
                .nth(occurrence)
                .map(|(i, _)| i);

            let layer = match found.and_then(|i| old[i].take()) {
                Some(layer) => layer,
                None => GridLayer {
                    kind: mesh_layer.kind,
                    values: mesh_layer.kind.default_value().repeat(self.len),
                },
            };
            layers.push(layer);
        }

        self.layers = layers;
        self.links = (0..cd.layers().len()).map(Some).collect();
    }

    /// Keep only the points with `remap[i] = Some(new_index)`, in new-index order.
    pub fn remap_points(&mut self, remap: &[Option<usize>], new_len: usize) {
        for layer in &mut self.layers {
            let n = layer.kind.components();
            let mut values = vec![0.0; new_len * n];
            for (old, new) in remap.iter().enumerate() {
                if let Some(new) = *new {
                    values[new * n..(new + 1) * n]
                        .copy_from_slice(&layer.values[old * n..(old + 1) * n]);
                }
            }
            layer.values = values;
        }
        self.len = new_len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_ids_roundtrip() {
        for kind in [AttrKind::Float, AttrKind::Uv, AttrKind::Color, AttrKind::Mask] {
            assert_eq!(AttrKind::from_id(kind.id()), kind);
        }
        assert_eq!(AttrKind::from_id("vertex_group"), AttrKind::Float);
    }

    #[test]
    fn test_add_and_find_layers() {
        let mut cd = CustomData::new(3);
        let uv = cd.add_layer(AttrKind::Uv, "UVMap");
        let mask = cd.add_layer(AttrKind::Mask, "Mask");

        assert_eq!(cd.layer_index(AttrKind::Uv), Some(uv));
        assert_eq!(cd.layer_index(AttrKind::Mask), Some(mask));
        assert_eq!(cd.layer_index(AttrKind::Color), None);
        assert_eq!(cd.values(mask, 2), &[1.0]);

        cd.remove_layer(uv).unwrap();
        assert_eq!(cd.layer_index(AttrKind::Mask), Some(0));
        assert!(cd.remove_layer(5).is_err());
    }

    #[test]
    fn test_interpolate_normalizes_uv_but_not_float() {
        let mut cd = CustomData::new(3);
        let f = cd.add_layer(AttrKind::Float, "weight");
        let uv = cd.add_layer(AttrKind::Uv, "UVMap");
        cd.set(f, 0, &[2.0]);
        cd.set(f, 1, &[4.0]);
        cd.set(uv, 0, &[0.0, 0.0]);
        cd.set(uv, 1, &[1.0, 1.0]);

        cd.interpolate(2, &[0, 1], &[1.0, 1.0]);
        assert_eq!(cd.values(f, 2), &[6.0]);
        assert_eq!(cd.values(uv, 2), &[0.5, 0.5]);
    }

    #[test]
    fn test_grid_points_follow_mesh_layers() {
        let mut cd = CustomData::new(2);
        let mask = cd.add_layer(AttrKind::Mask, "Mask");
        cd.set(mask, 0, &[0.0]);
        cd.set(mask, 1, &[1.0]);

        let mut attrs = GridAttributes::from_mesh(&cd);
        let p = attrs.push_point();
        attrs.interpolate_from_mesh(p, &cd, &[0, 1], &[0.25, 0.75]);
        assert_eq!(attrs.values(0, p), &[0.75]);

        let q = attrs.push_point();
        attrs.set(0, q, &[0.25]);
        let r = attrs.push_point();
        attrs.interpolate(r, &[p, q], &[0.5, 0.5]);
        assert_eq!(attrs.values(0, r), &[0.5]);
        assert_eq!(attrs.len(), 3);
    }

    #[test]
    fn test_layer_add_remove_keeps_links() {
        let mut cd = CustomData::new(1);
        cd.add_layer(AttrKind::Float, "a");
        let mut attrs = GridAttributes::from_mesh(&cd);
        attrs.push_point();

        let color = cd.add_layer(AttrKind::Color, "col");
        attrs.on_new_layer(AttrKind::Color, color);
        assert_eq!(attrs.values(1, 0), &[1.0, 1.0, 1.0, 1.0]);

        cd.remove_layer(0).unwrap();
        attrs.on_remove_layer(0);
        assert_eq!(attrs.layers().len(), 1);
        assert_eq!(attrs.links(), &[Some(0)]);
        assert_eq!(attrs.layout(), vec!["color".to_string()]);
    }

    #[test]
    fn test_relink_by_kind_and_order() {
        let layout = vec!["uv".to_string(), "mask".to_string(), "uv".to_string()];
        let values = vec![vec![0.1, 0.1], vec![0.5], vec![0.9, 0.9]];
        let mut attrs = GridAttributes::from_layout(&layout, values, 1).unwrap();

        // Mesh order differs from the saved one and has no second uv layer
        let mut cd = CustomData::new(1);
        cd.add_layer(AttrKind::Mask, "Mask");
        cd.add_layer(AttrKind::Uv, "UVMap");
        cd.add_layer(AttrKind::Color, "Col");

        attrs.relink(&cd);
        assert_eq!(attrs.layout(), vec!["mask", "uv", "color"]);
        assert_eq!(attrs.values(0, 0), &[0.5]);
        assert_eq!(attrs.values(1, 0), &[0.1, 0.1]);
        assert_eq!(attrs.values(2, 0), &[1.0, 1.0, 1.0, 1.0]);
        assert_eq!(attrs.links(), &[Some(0), Some(1), Some(2)]);
    }

    #[test]
    fn test_layout_mismatch_is_migration_error() {
        let layout = vec!["uv".to_string()];
        let result = GridAttributes::from_layout(&layout, vec![vec![0.0]], 1);
        assert!(matches!(result, Err(MeshError::Migration(_))));
    }

    #[test]
    fn test_remap_points() {
        let mut cd = CustomData::new(0);
        cd.add_layer(AttrKind::Float, "w");
        let mut attrs = GridAttributes::from_mesh(&cd);
        for i in 0..3 {
            let p = attrs.push_point();
            attrs.set(0, p, &[i as f64]);
        }
        attrs.remap_points(&[Some(1), None, Some(0)], 2);
        assert_eq!(attrs.values(0, 0), &[2.0]);
        assert_eq!(attrs.values(0, 1), &[0.0]);
    }
}
