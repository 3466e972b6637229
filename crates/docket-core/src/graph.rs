//! Unit dependency graph.

use crate::CoreError;
use docket_schema::{validate_units, UnitDefinition, UnitName};
use std::collections::{BTreeMap, VecDeque};

/// Validated, acyclic set of units with a deterministic start order.
#[derive(Debug, Clone)]
pub struct UnitGraph {
    units: BTreeMap<UnitName, UnitDefinition>,
    dependents: BTreeMap<UnitName, Vec<UnitName>>,
    order: Vec<UnitName>,
}

impl UnitGraph {
    /// Validate references and topologically sort. Unknown dependencies and cycles are errors.
    pub fn build(units: Vec<UnitDefinition>) -> Result<Self, CoreError> {
        validate_units(&units)?;

        let mut in_degree: BTreeMap<UnitName, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<UnitName, Vec<UnitName>> = BTreeMap::new();
        for unit in &units {
            in_degree.insert(unit.name.clone(), 0);
            dependents.insert(unit.name.clone(), Vec::new());
        }
        for unit in &units {
            let mut seen = Vec::new();
            for dep in &unit.depends_on {
                if seen.contains(&dep) {
                    continue;
                }
                seen.push(dep);
                if let Some(list) = dependents.get_mut(dep) {
                    list.push(unit.name.clone());
                }
                if let Some(degree) = in_degree.get_mut(&unit.name) {
                    *degree += 1;
                }
            }
        }

        // Kahn's algorithm; BTreeMap iteration keeps ties in name order.
        let mut queue: VecDeque<UnitName> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(name, _)| name.clone())
            .collect();
        let mut order = Vec::with_capacity(units.len());
        while let Some(name) = queue.pop_front() {
            if let Some(children) = dependents.get(&name) {
                for child in children {
                    if let Some(degree) = in_degree.get_mut(child) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(child.clone());
                        }
                    }
                }
            }
            order.push(name);
        }

        if order.len() != units.len() {
            let stuck: Vec<String> = in_degree
                .into_iter()
                .filter(|(_, degree)| *degree > 0)
                .map(|(name, _)| name.into_inner())
                .collect();
            return Err(CoreError::DependencyCycle(stuck));
        }

        Ok(Self {
            units: units.into_iter().map(|u| (u.name.clone(), u)).collect(),
            dependents,
            order,
        })
    }

    /// Units in an order where every unit follows all of its dependencies.
    pub fn order(&self) -> &[UnitName] {
        &self.order
    }

    pub fn unit(&self, name: &str) -> Option<&UnitDefinition> {
        self.units.get(&UnitName::new(name))
    }

    pub fn units(&self) -> impl Iterator<Item = &UnitDefinition> {
        self.order.iter().filter_map(|name| self.units.get(name))
    }

    pub fn dependents(&self, name: &str) -> &[UnitName] {
        self.dependents
            .get(&UnitName::new(name))
            .map_or(&[], Vec::as_slice)
    }

    /// Units with no dependencies.
    pub fn roots(&self) -> Vec<&UnitName> {
        self.units()
            .filter(|u| u.depends_on.is_empty())
            .map(|u| &u.name)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
