//! Step-graph validation. The graph is tiny, so it is held as an
//! adjacency list over step indices and topologically layered once before
//! execution; steps inside one layer run concurrently.

use std::collections::HashMap;

use crate::error::LitMcpError;

use super::config::Step;

/// Dependency indices per step: explicit `depends_on`, or the implicit
/// previous-step edge when the field is absent.
pub fn dependencies(steps: &[Step]) -> Result<Vec<Vec<usize>>, LitMcpError> {
    let index: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut deps = Vec::with_capacity(steps.len());
    for (i, step) in steps.iter().enumerate() {
        let step_deps = match &step.depends_on {
            None => {
                if i == 0 {
                    Vec::new()
                } else {
                    vec![i - 1]
                }
            }
            Some(ids) => {
                let mut resolved = Vec::with_capacity(ids.len());
                for id in ids {
                    let Some(&dep) = index.get(id.as_str()) else {
                        return Err(LitMcpError::invalid(format!(
                            "Step \"{}\" depends on undefined step \"{id}\"",
                            step.id
                        )));
                    };
                    if dep == i {
                        return Err(LitMcpError::invalid(format!(
                            "Step \"{}\" depends on itself",
                            step.id
                        )));
                    }
                    resolved.push(dep);
                }
                resolved
            }
        };
        deps.push(step_deps);
    }
    Ok(deps)
}

/// Kahn layering. Fails with `invalid-pipeline` on any cycle.
pub fn topo_levels(steps: &[Step]) -> Result<Vec<Vec<usize>>, LitMcpError> {
    let deps = dependencies(steps)?;
    let n = steps.len();
    let mut indegree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, step_deps) in deps.iter().enumerate() {
        indegree[i] = step_deps.len();
        for &d in step_deps {
            dependents[d].push(i);
        }
    }

    let mut levels = Vec::new();
    let mut current: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut processed = 0usize;
    while !current.is_empty() {
        processed += current.len();
        let mut next = Vec::new();
        for &i in &current {
            for &j in &dependents[i] {
                indegree[j] -= 1;
                if indegree[j] == 0 {
                    next.push(j);
                }
            }
        }
        levels.push(std::mem::take(&mut current));
        current = next;
    }

    if processed != n {
        return Err(LitMcpError::invalid(
            "Pipeline steps contain a dependency cycle",
        ));
    }
    Ok(levels)
}
