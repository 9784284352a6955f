//! Stack templates for the network and the worker node group
//!
//! Both templates are rendered with minijinja into CloudFormation YAML using
//! the long-form intrinsic syntax (`{"Ref": ...}`), so the rendered text is
//! plain YAML that any parser can read back. Security-group rules are
//! computed here rather than branched inside the template.

use ekstest_common::{Error, Result};
use minijinja::{context, Environment};
use serde::Serialize;

/// Logical output ids of the network stack
pub mod network_outputs {
    /// VPC id
    pub const VPC_ID: &str = "VpcId";
    /// Comma-joined subnet ids
    pub const SUBNET_IDS: &str = "SubnetIds";
    /// Control-plane security group id
    pub const SECURITY_GROUPS: &str = "SecurityGroups";
}

/// Logical output ids of the worker stack
pub mod worker_outputs {
    /// Instance role ARN the nodes run under
    pub const NODE_INSTANCE_ROLE: &str = "NodeInstanceRole";
    /// Worker security group id
    pub const NODE_SECURITY_GROUP: &str = "NodeSecurityGroup";
}

/// Resource type of the auto-scaling group inside the worker stack
pub const ASG_RESOURCE_TYPE: &str = "AWS::AutoScaling::AutoScalingGroup";

/// SSM parameter holding the recommended node image for a Kubernetes version
pub fn ami_parameter(kubernetes_version: &str) -> String {
    format!(
        "/aws/service/eks/optimized-ami/{}/amazon-linux-2/recommended/image_id",
        kubernetes_version
    )
}

const VPC_TEMPLATE: &str = r#"AWSTemplateFormatVersion: "2010-09-09"
Description: "Network for cluster {{ cluster_name }}"
Resources:
  VPC:
    Type: AWS::EC2::VPC
    Properties:
      CidrBlock: "192.168.0.0/16"
      EnableDnsSupport: true
      EnableDnsHostnames: true
      Tags:
      - {"Key": "Name", "Value": "{{ cluster_name }}-VPC"}
  InternetGateway:
    Type: AWS::EC2::InternetGateway
  VPCGatewayAttachment:
    Type: AWS::EC2::VPCGatewayAttachment
    Properties:
      InternetGatewayId: {"Ref": "InternetGateway"}
      VpcId: {"Ref": "VPC"}
  RouteTable:
    Type: AWS::EC2::RouteTable
    Properties:
      VpcId: {"Ref": "VPC"}
  Route:
    DependsOn: VPCGatewayAttachment
    Type: AWS::EC2::Route
    Properties:
      RouteTableId: {"Ref": "RouteTable"}
      DestinationCidrBlock: "0.0.0.0/0"
      GatewayId: {"Ref": "InternetGateway"}
{%- for subnet in subnets %}
  {{ subnet.id }}:
    Type: AWS::EC2::Subnet
    Properties:
      AvailabilityZone: {"Fn::Select": ["{{ subnet.index }}", {"Fn::GetAZs": {"Ref": "AWS::Region"}}]}
      CidrBlock: "{{ subnet.cidr }}"
      MapPublicIpOnLaunch: true
      VpcId: {"Ref": "VPC"}
      Tags:
      - {"Key": "Name", "Value": "{{ cluster_name }}-{{ subnet.id }}"}
      - {"Key": "kubernetes.io/cluster/{{ cluster_name }}", "Value": "shared"}
      - {"Key": "kubernetes.io/role/elb", "Value": "1"}
  {{ subnet.id }}RouteTableAssociation:
    Type: AWS::EC2::SubnetRouteTableAssociation
    Properties:
      SubnetId: {"Ref": "{{ subnet.id }}"}
      RouteTableId: {"Ref": "RouteTable"}
{%- endfor %}
  ControlPlaneSecurityGroup:
    Type: AWS::EC2::SecurityGroup
    Properties:
      GroupDescription: "Cluster communication with worker nodes"
      VpcId: {"Ref": "VPC"}
Outputs:
  VpcId:
    Description: "The VPC id"
    Value: {"Ref": "VPC"}
  SubnetIds:
    Description: "All subnets in the VPC"
    Value: {"Fn::Join": [",", [{% for subnet in subnets %}{"Ref": "{{ subnet.id }}"}{% if not loop.last %}, {% endif %}{% endfor %}]]}
  SecurityGroups:
    Description: "Security group for the cluster control plane"
    Value: {"Ref": "ControlPlaneSecurityGroup"}
"#;

#[derive(Serialize)]
struct SubnetSpec {
    id: String,
    index: usize,
    cidr: String,
}

/// Render the network stack with one subnet, or three when `enable_ha`
pub fn render_vpc(cluster_name: &str, enable_ha: bool) -> Result<String> {
    let count = if enable_ha { 3 } else { 1 };
    let subnets: Vec<SubnetSpec> = (0..count)
        .map(|i| SubnetSpec {
            id: format!("Subnet{:02}", i + 1),
            index: i,
            cidr: format!("192.168.{}.0/18", i * 64),
        })
        .collect();
    render("vpc", VPC_TEMPLATE, context! { cluster_name, subnets })
}

/// Source of a security-group ingress rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSource {
    /// An IPv4 range
    Cidr(String),
    /// Another security group
    Group(String),
}

/// One ingress rule of the worker security group
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SgRule {
    /// Description shown in the console
    pub description: String,
    /// First port
    pub from_port: u16,
    /// Last port
    pub to_port: u16,
    /// Where traffic may come from
    pub source: RuleSource,
}

/// Ingress rules of the worker security group
///
/// The control plane always reaches the kubelet (10250) and extension API
/// servers (443). Privileged access widens that to every port, and SSH
/// opens 22 to the world for log collection.
pub fn worker_ingress_rules(
    control_plane_sg: &str,
    enable_ssh: bool,
    enable_privileged: bool,
) -> Vec<SgRule> {
    let from_control_plane = |description: &str, from_port, to_port| SgRule {
        description: description.to_string(),
        from_port,
        to_port,
        source: RuleSource::Group(control_plane_sg.to_string()),
    };

    let mut rules = if enable_privileged {
        vec![from_control_plane("control plane to every node port", 1, 65535)]
    } else {
        vec![
            from_control_plane("control plane to extension API servers", 443, 443),
            from_control_plane("control plane to kubelet", 10250, 10250),
        ]
    };
    if enable_ssh {
        rules.push(SgRule {
            description: "SSH for log collection".to_string(),
            from_port: 22,
            to_port: 22,
            source: RuleSource::Cidr("0.0.0.0/0".to_string()),
        });
    }
    rules
}

/// Inputs of the worker node group stack
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerParams {
    /// Cluster the nodes join
    pub cluster_name: String,
    /// SSH key pair name
    pub key_name: String,
    /// Node image; empty resolves the recommended image through SSM
    pub ami: String,
    /// Kubernetes version used to resolve the recommended image
    pub kubernetes_version: String,
    /// Instance type
    pub instance_type: String,
    /// Minimum group size
    pub asg_min: u32,
    /// Maximum group size
    pub asg_max: u32,
    /// Root volume size in GB
    pub volume_size_gb: u32,
    /// VPC id
    pub vpc_id: String,
    /// Subnets the group spans
    pub subnet_ids: Vec<String>,
    /// Control-plane security group id
    pub control_plane_sg: String,
    /// Open TCP/22 to the world
    pub enable_ssh: bool,
    /// Open every port to the control plane
    pub enable_privileged: bool,
}

const WORKER_TEMPLATE: &str = r##"AWSTemplateFormatVersion: "2010-09-09"
Description: "Worker node group for cluster {{ p.cluster_name }}"
{%- if not p.ami %}
Parameters:
  NodeImageId:
    Type: "AWS::SSM::Parameter::Value<AWS::EC2::Image::Id>"
    Default: "{{ ami_parameter }}"
{%- endif %}
Resources:
  NodeInstanceRole:
    Type: AWS::IAM::Role
    Properties:
      AssumeRolePolicyDocument:
        Version: "2012-10-17"
        Statement:
        - Effect: Allow
          Principal:
            Service:
            - "ec2.amazonaws.com"
          Action:
          - "sts:AssumeRole"
      Path: "/"
      ManagedPolicyArns:
      - "arn:aws:iam::aws:policy/AmazonEKSWorkerNodePolicy"
      - "arn:aws:iam::aws:policy/AmazonEKS_CNI_Policy"
      - "arn:aws:iam::aws:policy/AmazonEC2ContainerRegistryReadOnly"
  NodeInstanceProfile:
    Type: AWS::IAM::InstanceProfile
    Properties:
      Path: "/"
      Roles:
      - {"Ref": "NodeInstanceRole"}
  NodeSecurityGroup:
    Type: AWS::EC2::SecurityGroup
    Properties:
      GroupDescription: "Security group for all nodes in the cluster"
      VpcId: "{{ p.vpc_id }}"
      SecurityGroupIngress:
{%- for rule in rules %}
      - Description: "{{ rule.description }}"
        IpProtocol: tcp
        FromPort: {{ rule.from_port }}
        ToPort: {{ rule.to_port }}
{%- if rule.source.cidr %}
        CidrIp: "{{ rule.source.cidr }}"
{%- else %}
        SourceSecurityGroupId: "{{ rule.source.group }}"
{%- endif %}
{%- endfor %}
      Tags:
      - {"Key": "kubernetes.io/cluster/{{ p.cluster_name }}", "Value": "owned"}
  NodeSecurityGroupIngressSelf:
    Type: AWS::EC2::SecurityGroupIngress
    Properties:
      Description: "Node to node communication"
      GroupId: {"Ref": "NodeSecurityGroup"}
      SourceSecurityGroupId: {"Ref": "NodeSecurityGroup"}
      IpProtocol: "-1"
      FromPort: 0
      ToPort: 65535
  ControlPlaneIngressFromNodes:
    Type: AWS::EC2::SecurityGroupIngress
    Properties:
      Description: "Pods to cluster API server"
      GroupId: "{{ p.control_plane_sg }}"
      SourceSecurityGroupId: {"Ref": "NodeSecurityGroup"}
      IpProtocol: tcp
      FromPort: 443
      ToPort: 443
  NodeLaunchConfig:
    Type: AWS::AutoScaling::LaunchConfiguration
    Properties:
      AssociatePublicIpAddress: true
      IamInstanceProfile: {"Ref": "NodeInstanceProfile"}
      ImageId: {% if p.ami %}"{{ p.ami }}"{% else %}{"Ref": "NodeImageId"}{% endif %}
      InstanceType: "{{ p.instance_type }}"
      KeyName: "{{ p.key_name }}"
      SecurityGroups:
      - {"Ref": "NodeSecurityGroup"}
      BlockDeviceMappings:
      - DeviceName: /dev/xvda
        Ebs:
          VolumeSize: {{ p.volume_size_gb }}
          VolumeType: gp2
          DeleteOnTermination: true
      UserData:
        "Fn::Base64": "#!/bin/bash\nset -o xtrace\n/etc/eks/bootstrap.sh {{ p.cluster_name }}\n"
  NodeGroup:
    Type: AWS::AutoScaling::AutoScalingGroup
    Properties:
      DesiredCapacity: "{{ p.asg_max }}"
      LaunchConfigurationName: {"Ref": "NodeLaunchConfig"}
      MinSize: "{{ p.asg_min }}"
      MaxSize: "{{ p.asg_max }}"
      VPCZoneIdentifier:
{%- for subnet in p.subnet_ids %}
      - "{{ subnet }}"
{%- endfor %}
      Tags:
      - {"Key": "Name", "Value": "{{ p.cluster_name }}-Node", "PropagateAtLaunch": "true"}
      - {"Key": "kubernetes.io/cluster/{{ p.cluster_name }}", "Value": "owned", "PropagateAtLaunch": "true"}
    UpdatePolicy:
      AutoScalingRollingUpdate:
        MinInstancesInService: "{{ p.asg_min }}"
        MaxBatchSize: "1"
Outputs:
  NodeInstanceRole:
    Description: "The node instance role"
    Value: {"Fn::GetAtt": ["NodeInstanceRole", "Arn"]}
  NodeSecurityGroup:
    Description: "The security group for the node group"
    Value: {"Ref": "NodeSecurityGroup"}
"##;

/// Render the worker node group stack
pub fn render_worker(params: &WorkerParams) -> Result<String> {
    if params.subnet_ids.is_empty() {
        return Err(Error::invalid_config(
            "subnet-ids",
            "worker node group needs at least one subnet",
        ));
    }
    let rules = worker_ingress_rules(
        &params.control_plane_sg,
        params.enable_ssh,
        params.enable_privileged,
    );
    render(
        "worker",
        WORKER_TEMPLATE,
        context! {
            p => params,
            rules,
            ami_parameter => ami_parameter(&params.kubernetes_version),
        },
    )
}

fn render(name: &str, template: &str, ctx: minijinja::Value) -> Result<String> {
    Environment::new()
        .render_str(template, ctx)
        .map_err(|e| Error::internal_with_context(format!("{}-template", name), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_yaml::Value;

    fn worker_params() -> WorkerParams {
        WorkerParams {
            cluster_name: "test-ci".to_string(),
            key_name: "test-ci-KEY-PAIR".to_string(),
            ami: String::new(),
            kubernetes_version: "1.29".to_string(),
            instance_type: "m5.large".to_string(),
            asg_min: 1,
            asg_max: 1,
            volume_size_gb: 40,
            vpc_id: "vpc-0a1b".to_string(),
            subnet_ids: vec!["subnet-a".to_string(), "subnet-b".to_string()],
            control_plane_sg: "sg-cp".to_string(),
            enable_ssh: true,
            enable_privileged: false,
        }
    }

    fn ingress_rules(rendered: &str) -> Vec<Value> {
        let doc: Value = serde_yaml::from_str(rendered).unwrap();
        doc["Resources"]["NodeSecurityGroup"]["Properties"]["SecurityGroupIngress"]
            .as_sequence()
            .cloned()
            .unwrap_or_default()
    }

    // =========================================================================
    // Network stack
    // =========================================================================

    #[test]
    fn test_vpc_single_subnet_without_ha() {
        let doc: Value = serde_yaml::from_str(&render_vpc("test-ci", false).unwrap()).unwrap();
        assert!(doc["Resources"]["Subnet01"].is_mapping());
        assert!(doc["Resources"]["Subnet02"].is_null());
        let joined = &doc["Outputs"]["SubnetIds"]["Value"]["Fn::Join"][1];
        assert_eq!(joined.as_sequence().map(Vec::len), Some(1));
    }

    #[test]
    fn test_vpc_three_subnets_with_ha() {
        let doc: Value = serde_yaml::from_str(&render_vpc("test-ci", true).unwrap()).unwrap();
        for id in ["Subnet01", "Subnet02", "Subnet03"] {
            assert!(doc["Resources"][id].is_mapping(), "{} missing", id);
        }
        let joined = &doc["Outputs"]["SubnetIds"]["Value"]["Fn::Join"][1];
        assert_eq!(joined.as_sequence().map(Vec::len), Some(3));
        assert_eq!(
            doc["Outputs"]["SecurityGroups"]["Value"]["Ref"].as_str(),
            Some("ControlPlaneSecurityGroup")
        );
    }

    // =========================================================================
    // Worker stack
    // =========================================================================

    /// Story: SSH on, privileged off. The rendered stack parses as YAML,
    /// opens 22 to the world, and never opens the 1025+ range.
    #[test]
    fn story_worker_template_round_trip() {
        let rendered = render_worker(&worker_params()).unwrap();
        let rules = ingress_rules(&rendered);

        let ssh = rules.iter().find(|r| r["FromPort"].as_u64() == Some(22));
        let ssh = ssh.expect("ssh rule");
        assert_eq!(ssh["ToPort"].as_u64(), Some(22));
        assert_eq!(ssh["CidrIp"].as_str(), Some("0.0.0.0/0"));

        assert!(rules.iter().all(|r| r["FromPort"].as_u64() != Some(1025)));
    }

    #[test]
    fn test_worker_privileged_opens_all_ports_to_control_plane() {
        let mut params = worker_params();
        params.enable_ssh = false;
        params.enable_privileged = true;
        let rules = ingress_rules(&render_worker(&params).unwrap());
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0]["FromPort"].as_u64(), Some(1));
        assert_eq!(rules[0]["ToPort"].as_u64(), Some(65535));
        assert_eq!(rules[0]["SourceSecurityGroupId"].as_str(), Some("sg-cp"));
    }

    #[test]
    fn test_worker_ami_resolution() {
        let doc: Value = serde_yaml::from_str(&render_worker(&worker_params()).unwrap()).unwrap();
        assert_eq!(
            doc["Parameters"]["NodeImageId"]["Default"].as_str(),
            Some("/aws/service/eks/optimized-ami/1.29/amazon-linux-2/recommended/image_id")
        );

        let mut params = worker_params();
        params.ami = "ami-0123".to_string();
        let doc: Value = serde_yaml::from_str(&render_worker(&params).unwrap()).unwrap();
        assert!(doc["Parameters"].is_null());
        assert_eq!(
            doc["Resources"]["NodeLaunchConfig"]["Properties"]["ImageId"].as_str(),
            Some("ami-0123")
        );
    }

    #[test]
    fn test_worker_user_data_bootstraps_the_cluster() {
        let doc: Value = serde_yaml::from_str(&render_worker(&worker_params()).unwrap()).unwrap();
        let user_data = doc["Resources"]["NodeLaunchConfig"]["Properties"]["UserData"]
            ["Fn::Base64"]
            .as_str()
            .unwrap();
        assert!(user_data.starts_with("#!/bin/bash\n"));
        assert!(user_data.contains("/etc/eks/bootstrap.sh test-ci"));
    }

    #[test]
    fn test_worker_sizes_and_subnets() {
        let doc: Value = serde_yaml::from_str(&render_worker(&worker_params()).unwrap()).unwrap();
        let group = &doc["Resources"]["NodeGroup"]["Properties"];
        assert_eq!(group["MaxSize"].as_str(), Some("1"));
        assert_eq!(group["VPCZoneIdentifier"].as_sequence().map(Vec::len), Some(2));
        assert_eq!(
            doc["Outputs"]["NodeInstanceRole"]["Value"]["Fn::GetAtt"][0].as_str(),
            Some("NodeInstanceRole")
        );
    }

    #[test]
    fn test_worker_requires_subnets() {
        let mut params = worker_params();
        params.subnet_ids.clear();
        let err = render_worker(&params).unwrap_err();
        assert_eq!(err.kind(), ekstest_common::ErrorKind::InvalidConfig);
    }
}
