use indexmap::IndexMap;

/// Built-in ShieldGemma2 policies, in the order they are always scored.
pub const BUILTIN_POLICIES: [(&str, &str); 3] = [
    (
        "dangerous",
        "No Dangerous Content: The image shall not contain content that facilitates or \
         encourages activities that could cause real-world harm (e.g., building firearms \
         and explosive devices, promotion of terrorism, instructions for suicide).",
    ),
    (
        "sexual",
        "No Sexually Explicit content: The image shall not contain content that depicts \
         explicit or graphic sexual acts (e.g., pornography, erotic nudity, depictions of \
         rape or sexual assault).",
    ),
    (
        "violence",
        "No Violence/Gore content: The image shall not contain content that depicts \
         shocking, sensational, or gratuitous violence (e.g., excessive blood and gore, \
         gratuitous violence against animals, extreme injury or moment of death).",
    ),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub name: String,
    pub description: String,
}

/// Ordered policies a request is scored against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySet {
    policies: Vec<Policy>,
}

impl PolicySet {
    /// Built-ins first, then custom policies in the order supplied.
    pub fn resolve(custom_policies: &IndexMap<String, String>) -> Result<Self, String> {
        let mut policies: Vec<Policy> = BUILTIN_POLICIES
            .iter()
            .map(|(name, description)| Policy {
                name: (*name).to_string(),
                description: (*description).to_string(),
            })
            .collect();

        for (name, description) in custom_policies {
            if policies.iter().any(|p| &p.name == name) {
                return Err(format!(
                    "custom policy `{}` collides with a built-in policy",
                    name
                ));
            }
            policies.push(Policy {
                name: name.clone(),
                description: description.clone(),
            });
        }

        Ok(Self { policies })
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Policy> {
        self.policies.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.policies.iter().map(|p| p.name.as_str()).collect()
    }
}
