use std::{collections::HashMap, sync::Arc};

use super::plugin::ChannelPlugin;

/// Registry of all loaded channel plugins.
pub struct ChannelRegistry {
    plugins: HashMap<String, Arc<dyn ChannelPlugin>>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
        }
    }

    pub fn register(&mut self, plugin: Arc<dyn ChannelPlugin>) {
        self.plugins.insert(plugin.id().to_string(), plugin);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ChannelPlugin>> {
        self.plugins.get(id).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.plugins.keys().cloned().collect();
        ids.sort();
        ids
    }
}
