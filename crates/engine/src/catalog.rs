//! Catalog of the resource types the engine can provision.
//!
//! Each entry declares how the provider formats physical identifiers (which is
//! also what `Ref` returns), which attributes `Fn::GetAtt` may read, and which
//! properties must be present before a create call is issued.

/// How a resource type's physical identifier looks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysicalIdFormat {
    /// `<prefix>-<hex>`, e.g. `vpc-0a1b2c3d4e5f67890`.
    Prefixed(&'static str),
    /// An ARN whose resource segment starts with the given path.
    Arn { service: &'static str, resource: &'static str },
}

/// Static description of a supported resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceKind {
    pub type_name: &'static str,
    pub physical_id: PhysicalIdFormat,
    pub attributes: &'static [&'static str],
    pub required_properties: &'static [&'static str],
}

impl ResourceKind {
    pub fn has_attribute(&self, attribute: &str) -> bool {
        self.attributes.contains(&attribute)
    }
}

const CATALOG: &[ResourceKind] = &[
    ResourceKind {
        type_name: "AWS::EC2::VPC",
        physical_id: PhysicalIdFormat::Prefixed("vpc"),
        attributes: &["CidrBlock", "CidrBlockAssociations", "DefaultNetworkAcl", "DefaultSecurityGroup", "Ipv6CidrBlocks", "VpcId"],
        required_properties: &["CidrBlock"],
    },
    ResourceKind {
        type_name: "AWS::EC2::Subnet",
        physical_id: PhysicalIdFormat::Prefixed("subnet"),
        attributes: &["AvailabilityZone", "CidrBlock", "Ipv6CidrBlocks", "NetworkAclAssociationId", "SubnetId", "VpcId"],
        required_properties: &["VpcId"],
    },
    ResourceKind {
        type_name: "AWS::EC2::InternetGateway",
        physical_id: PhysicalIdFormat::Prefixed("igw"),
        attributes: &["InternetGatewayId"],
        required_properties: &[],
    },
    ResourceKind {
        type_name: "AWS::EC2::VPCGatewayAttachment",
        physical_id: PhysicalIdFormat::Prefixed("igwattach"),
        attributes: &[],
        required_properties: &["VpcId"],
    },
    ResourceKind {
        type_name: "AWS::EC2::RouteTable",
        physical_id: PhysicalIdFormat::Prefixed("rtb"),
        attributes: &["RouteTableId"],
        required_properties: &["VpcId"],
    },
    ResourceKind {
        type_name: "AWS::EC2::Route",
        physical_id: PhysicalIdFormat::Prefixed("r"),
        attributes: &[],
        required_properties: &["RouteTableId"],
    },
    ResourceKind {
        type_name: "AWS::EC2::SubnetRouteTableAssociation",
        physical_id: PhysicalIdFormat::Prefixed("rtbassoc"),
        attributes: &["Id"],
        required_properties: &["RouteTableId", "SubnetId"],
    },
    ResourceKind {
        type_name: "AWS::EC2::SecurityGroup",
        physical_id: PhysicalIdFormat::Prefixed("sg"),
        attributes: &["GroupId", "VpcId"],
        required_properties: &["GroupDescription"],
    },
    ResourceKind {
        type_name: "AWS::EC2::SecurityGroupIngress",
        physical_id: PhysicalIdFormat::Prefixed("sgr"),
        attributes: &["Id"],
        required_properties: &["IpProtocol"],
    },
    ResourceKind {
        type_name: "AWS::EC2::Instance",
        physical_id: PhysicalIdFormat::Prefixed("i"),
        attributes: &["AvailabilityZone", "InstanceId", "PrivateDnsName", "PrivateIp", "PublicDnsName", "PublicIp"],
        required_properties: &["ImageId"],
    },
    ResourceKind {
        type_name: "AWS::ElasticLoadBalancingV2::LoadBalancer",
        physical_id: PhysicalIdFormat::Arn {
            service: "elasticloadbalancing",
            resource: "loadbalancer/app",
        },
        attributes: &[
            "CanonicalHostedZoneID",
            "DNSName",
            "LoadBalancerArn",
            "LoadBalancerFullName",
            "LoadBalancerName",
            "SecurityGroups",
        ],
        required_properties: &[],
    },
    ResourceKind {
        type_name: "AWS::ElasticLoadBalancingV2::TargetGroup",
        physical_id: PhysicalIdFormat::Arn {
            service: "elasticloadbalancing",
            resource: "targetgroup",
        },
        attributes: &["LoadBalancerArns", "TargetGroupArn", "TargetGroupFullName", "TargetGroupName"],
        required_properties: &[],
    },
    ResourceKind {
        type_name: "AWS::ElasticLoadBalancingV2::Listener",
        physical_id: PhysicalIdFormat::Arn {
            service: "elasticloadbalancing",
            resource: "listener/app",
        },
        attributes: &["ListenerArn"],
        required_properties: &["DefaultActions", "LoadBalancerArn"],
    },
];

/// Look up a resource type by its tag.
pub fn lookup(type_name: &str) -> Option<&'static ResourceKind> {
    CATALOG.iter().find(|kind| kind.type_name == type_name)
}

/// All supported resource types in catalog order.
pub fn supported_types() -> impl Iterator<Item = &'static str> {
    CATALOG.iter().map(|kind| kind.type_name)
}
