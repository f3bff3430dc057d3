//! Inter-board topology.
//!
//! Boards declare connectivity through their exposed sub-entities: a
//! `DownstreamPort` names the port type it connects to via
//! `ConnectsToType`, any other `…Port`-typed expose is an upstream port
//! of that type. Matching pairs become `contained_by`/`containing`
//! association edges attached to the downstream board.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

/// `(forward, reverse, path)` association triple.
pub type Association = (String, String, String);

#[derive(Default)]
pub struct Topology {
    /// Port type → board paths exposing an upstream port of that type.
    upstream_ports: HashMap<String, Vec<String>>,
    /// Port type → board paths with a downstream port connecting to it.
    downstream_ports: HashMap<String, Vec<String>>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.upstream_ports.clear();
        self.downstream_ports.clear();
    }

    /// Record the topology hints of one exposed sub-entity.
    pub fn add_board(&mut self, board_path: &str, expose: &Value) {
        let Some(expose_type) = expose.get("Type").and_then(Value::as_str) else {
            return;
        };
        if expose_type == "DownstreamPort" {
            let Some(connects_to) = expose.get("ConnectsToType").and_then(Value::as_str) else {
                return;
            };
            self.downstream_ports
                .entry(connects_to.to_string())
                .or_default()
                .push(board_path.to_string());
        } else if expose_type.ends_with("Port") {
            self.upstream_ports
                .entry(expose_type.to_string())
                .or_default()
                .push(board_path.to_string());
        }
    }

    /// Forget everything recorded for a board.
    pub fn remove(&mut self, board_path: &str) {
        for ports in self
            .upstream_ports
            .values_mut()
            .chain(self.downstream_ports.values_mut())
        {
            ports.retain(|path| path != board_path);
        }
    }

    /// Aggregate edges for the given boards: downstream board path →
    /// association triples towards each matching upstream board.
    pub fn associations(
        &self,
        boards: &BTreeMap<String, String>,
    ) -> BTreeMap<String, Vec<Association>> {
        let mut result: BTreeMap<String, Vec<Association>> = BTreeMap::new();
        for (port_type, downstreams) in &self.downstream_ports {
            let Some(upstreams) = self.upstream_ports.get(port_type) else {
                continue;
            };
            for downstream in downstreams {
                if !boards.contains_key(downstream) {
                    continue;
                }
                for upstream in upstreams {
                    result.entry(downstream.clone()).or_default().push((
                        "contained_by".to_string(),
                        "containing".to_string(),
                        upstream.clone(),
                    ));
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn boards(paths: &[&str]) -> BTreeMap<String, String> {
        paths
            .iter()
            .map(|p| (p.to_string(), "name".to_string()))
            .collect()
    }

    #[test]
    fn downstream_connects_to_upstream() {
        let mut topology = Topology::new();
        topology.add_board(
            "/inv/chassis/Backplane",
            &json!({"Name": "P1", "Type": "BackplanePort"}),
        );
        topology.add_board(
            "/inv/chassis/Drive",
            &json!({"Name": "P2", "Type": "DownstreamPort", "ConnectsToType": "BackplanePort"}),
        );

        let assocs = topology.associations(&boards(&[
            "/inv/chassis/Backplane",
            "/inv/chassis/Drive",
        ]));
        assert_eq!(
            assocs["/inv/chassis/Drive"],
            vec![(
                "contained_by".to_string(),
                "containing".to_string(),
                "/inv/chassis/Backplane".to_string()
            )]
        );
        assert!(!assocs.contains_key("/inv/chassis/Backplane"));
    }

    #[test]
    fn unmatched_port_types_produce_no_edges() {
        let mut topology = Topology::new();
        topology.add_board(
            "/inv/chassis/Drive",
            &json!({"Name": "P", "Type": "DownstreamPort", "ConnectsToType": "NoSuchPort"}),
        );
        assert!(topology.associations(&boards(&["/inv/chassis/Drive"])).is_empty());
    }

    #[test]
    fn non_port_exposes_are_ignored() {
        let mut topology = Topology::new();
        topology.add_board("/inv/board/X", &json!({"Name": "S", "Type": "TempSensor"}));
        assert!(topology.associations(&boards(&["/inv/board/X"])).is_empty());
    }

    #[test]
    fn removed_boards_drop_their_edges() {
        let mut topology = Topology::new();
        topology.add_board(
            "/inv/chassis/Backplane",
            &json!({"Name": "P1", "Type": "BackplanePort"}),
        );
        topology.add_board(
            "/inv/chassis/Drive",
            &json!({"Name": "P2", "Type": "DownstreamPort", "ConnectsToType": "BackplanePort"}),
        );
        topology.remove("/inv/chassis/Backplane");

        let assocs = topology.associations(&boards(&[
            "/inv/chassis/Backplane",
            "/inv/chassis/Drive",
        ]));
        assert!(assocs.is_empty());
    }
}
