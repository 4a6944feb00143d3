//! Compute instance setup script
//!
//! Rendered with Tera from the run's environment map. The same script is
//! passed as user data at launch and re-sent by `install --run-setup`.

use crate::error::Result;
use crate::naming::RunConfig;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::collections::BTreeMap;
use tera::{Context, Tera};

const SETUP_SCRIPT: &str = r#"#!/bin/bash
exec > >(tee /var/log/user-data.log) 2>&1
set -x

# Update system
yum update -y

# Install packages
yum install -y git docker

# Start docker
systemctl start docker
systemctl enable docker
usermod -aG docker ssm-user

# Restart docker to ensure clean state
systemctl restart docker
sleep 10

# Create ssm-user home if not exists
mkdir -p /home/ssm-user
chown ssm-user:ssm-user /home/ssm-user

# Clone repository
cd /home/ssm-user
rm -rf {{ git_name }}
git clone {{ repository_url }}
chown -R ssm-user:ssm-user {{ git_name }}

# Create config.json
mkdir -p /home/ssm-user/{{ git_name }}/application
cat > /home/ssm-user/{{ git_name }}/application/config.json << 'EOF'
{{ config_json | safe }}
EOF
chown -R ssm-user:ssm-user /home/ssm-user/{{ git_name }}

# Build and run docker with volume mount for config.json
cd /home/ssm-user/{{ git_name }}
docker build -f Dockerfile -t streamlit-app .
docker run -d --restart=always -p {{ port }}:{{ port }} -v $(pwd)/application/config.json:/app/application/config.json --name app streamlit-app

# Make update.sh executable for manual execution via SSM
chmod a+rx update.sh

# Restart SSM agent to ensure proper registration
echo "Restarting SSM agent..." >> /var/log/user-data.log
systemctl restart amazon-ssm-agent
systemctl enable amazon-ssm-agent
sleep 10
systemctl status amazon-ssm-agent >> /var/log/user-data.log

echo "Setup completed successfully" >> /var/log/user-data.log
"#;

/// Marker the script appends to its log when it finishes
pub const COMPLETION_MARKER: &str = "Setup completed successfully";

/// Render the setup script for `run` with `environment` as the app config
pub fn render_setup_script(
    run: &RunConfig,
    environment: &BTreeMap<String, String>,
) -> Result<String> {
    let mut context = Context::new();
    context.insert("git_name", &run.git_name);
    context.insert("repository_url", &run.repository_url());
    context.insert("port", &run.app_port);
    context.insert("config_json", &serde_json::to_string(environment)?);

    let mut tera = Tera::default();
    Ok(tera.render_str(SETUP_SCRIPT, &context)?)
}

/// Base64 form expected by the instance launch call
pub fn encode_user_data(script: &str) -> String {
    STANDARD.encode(script.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn environment() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("projectName".to_string(), "demo".to_string()),
            ("sharing_url".to_string(), "https://d1.cloudfront.net".to_string()),
        ])
    }

    #[test]
    fn test_script_contents() {
        let mut run = RunConfig::new("demo", "us-west-2", "123456789012");
        run.git_name = "demo-app".into();

        let script = render_setup_script(&run, &environment()).unwrap();

        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("git clone https://github.com/kyopark2014/demo-app\n"));
        assert!(script.contains("mkdir -p /home/ssm-user/demo-app/application"));
        assert!(script.contains("-p 8501:8501"));
        assert!(script.contains(
            r#"{"projectName":"demo","sharing_url":"https://d1.cloudfront.net"}"#
        ));
        assert!(script.contains(COMPLETION_MARKER));
    }

    #[test]
    fn test_user_data_is_base64() {
        let encoded = encode_user_data("#!/bin/bash\necho hi\n");
        let decoded = STANDARD.decode(encoded).unwrap();
        assert_eq!(decoded, b"#!/bin/bash\necho hi\n");
    }
}
