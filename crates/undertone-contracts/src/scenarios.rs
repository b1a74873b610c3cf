use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A social-context preset shaping the model's analytical framing.
///
/// `prompt_context` is injected verbatim into the system instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    pub name: String,
    pub description: String,
    pub icon: String,
    pub prompt_context: String,
}

/// Ordered, immutable scenario catalog loaded once at startup.
#[derive(Debug, Clone)]
pub struct ScenarioCatalog {
    scenarios: IndexMap<String, Scenario>,
}

impl ScenarioCatalog {
    pub fn new(scenarios: Option<IndexMap<String, Scenario>>) -> Self {
        Self {
            scenarios: scenarios.unwrap_or_else(default_scenarios),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Scenario> {
        self.scenarios.get(id)
    }

    pub fn list(&self) -> impl Iterator<Item = &Scenario> {
        self.scenarios.values()
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }

    /// The preset selected before the user picks one: the first entry.
    pub fn default_scenario(&self) -> Option<&Scenario> {
        self.scenarios.values().next()
    }
}

impl Default for ScenarioCatalog {
    fn default() -> Self {
        Self::new(None)
    }
}

fn default_scenarios() -> IndexMap<String, Scenario> {
    let mut map = IndexMap::new();

    let mut insert = |id: &str, name: &str, description: &str, icon: &str, prompt_context: &str| {
        map.insert(
            id.to_string(),
            Scenario {
                id: id.to_string(),
                name: name.to_string(),
                description: description.to_string(),
                icon: icon.to_string(),
                prompt_context: prompt_context.to_string(),
            },
        );
    };

    insert(
        "workplace_meeting",
        "职场生存",
        "内部会议、绩效面谈、跨部门协作或推诿。",
        "💼",
        "中国职场环境。重点识别“踢皮球”、“画大饼”、表面客气实则甩锅、阴阳怪气、以及基于层级观念的潜台词。注意区分“建议”是否代表强制命令。",
    );
    insert(
        "dating",
        "恋爱博弈",
        "初次约会、暧昧拉扯、冷战或分手边缘。",
        "💘",
        "当代恋爱语境。重点识别“好人卡”、假装矜持、欲擒故纵、情绪勒索（PUA前兆）或真正的拒绝信号。分析是否诚意不足或只是在养鱼。",
    );
    insert(
        "family",
        "家庭聚会",
        "亲戚催婚、代际沟通、春节饭局。",
        "🏠",
        "中国式家庭语境。重点识别以“为你好”包装的控制欲、亲戚间的隐形攀比、催婚催生背后的面子问题，以及长辈并未直接表达的情感需求。",
    );
    insert(
        "business_negotiation",
        "商务谈判",
        "销售攻单、合同博弈、甲方乙方。",
        "🤝",
        "高风险商业谈判。识别虚张声势、价格锚定、红白脸战术、假意让步以及“改天再聊”背后的真实意图。",
    );
    insert(
        "social_friendship",
        "社交饭局",
        "同学聚会、朋友圈互动、人情往来。",
        "🥂",
        "社交面子文化。重点识别凡尔赛式炫耀、捧杀、塑料友情、隐性排挤或通过玩笑说出的真心话。",
    );

    map
}

#[cfg(test)]
mod tests {
    use super::ScenarioCatalog;

    #[test]
    fn default_catalog_carries_five_presets_in_order() {
        let catalog = ScenarioCatalog::default();
        let ids: Vec<&str> = catalog.list().map(|scenario| scenario.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "workplace_meeting",
                "dating",
                "family",
                "business_negotiation",
                "social_friendship",
            ]
        );
        assert_eq!(
            catalog.default_scenario().map(|scenario| scenario.id.as_str()),
            Some("workplace_meeting")
        );
    }

    #[test]
    fn lookup_returns_prompt_context() {
        let catalog = ScenarioCatalog::default();
        let scenario = catalog.get("workplace_meeting").expect("preset present");
        assert_eq!(scenario.name, "职场生存");
        assert!(scenario.prompt_context.contains("职场"));
        assert!(catalog.get("missing").is_none());
    }
}
