mod recipe;

pub use recipe::{default_recipe_file, is_env_key, split_value, YamlRecipeFrontend};
