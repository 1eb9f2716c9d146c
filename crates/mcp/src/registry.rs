//! Merged tool routing table

use std::collections::HashMap;

use tracing::warn;

use crate::descriptor::ToolDescriptor;

/// A tool and the provider that serves it
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedTool {
    pub provider: String,
    pub descriptor: ToolDescriptor,
}

/// A tool name offered by more than one provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collision {
    pub tool: String,
    pub kept: String,
    pub dropped: String,
}

/// Tool name → provider, first registration wins
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    tools: Vec<RoutedTool>,
    index: HashMap<String, usize>,
}

impl RouteTable {
    /// Merge provider tool lists in the given order
    pub fn build<'a, I>(providers: I) -> (Self, Vec<Collision>)
    where
        I: IntoIterator<Item = (&'a str, &'a [ToolDescriptor])>,
    {
        let mut table = Self::default();
        let mut collisions = Vec::new();

        for (provider, tools) in providers {
            for tool in tools {
                if let Some(&existing) = table.index.get(&tool.name) {
                    let kept = table.tools[existing].provider.clone();
                    warn!(
                        "◆ TOOL COLLISION: '{}' from {} shadowed by {}",
                        tool.name, provider, kept
                    );
                    collisions.push(Collision {
                        tool: tool.name.clone(),
                        kept,
                        dropped: provider.to_string(),
                    });
                    continue;
                }
                table.index.insert(tool.name.clone(), table.tools.len());
                table.tools.push(RoutedTool {
                    provider: provider.to_string(),
                    descriptor: tool.clone(),
                });
            }
        }

        (table, collisions)
    }

    pub fn resolve(&self, tool: &str) -> Option<&RoutedTool> {
        self.index.get(tool).map(|&i| &self.tools[i])
    }

    pub fn tools(&self) -> &[RoutedTool] {
        &self.tools
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
